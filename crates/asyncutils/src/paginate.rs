use async_stream::stream;
use futures::Stream;
use std::future::Future;

/// One page of a cursor-paginated listing.
///
/// `next` is the opaque cursor to pass when requesting the following page;
/// `None` marks the terminal page. An empty `items` list is perfectly valid
/// on any page, including intermediate ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}
impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<String>) -> Self {
        Self { items, next }
    }

    /// Page with no further pages after it.
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Flatten a cursor-paginated API into a stream of items.
///
/// `fetch` is called with `None` for the first page and with the previous
/// page's `next` cursor afterwards. Requests are strictly sequential: the
/// next page is only requested once every item of the current page has been
/// yielded. The stream ends after the page whose `next` is `None`, or right
/// after the first error.
///
/// ```
/// use futures::TryStreamExt;
/// use melo_asyncutils::{Page, paginate};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pages = paginate(|cursor: Option<String>| async move {
///     Ok::<_, ()>(match cursor.as_deref() {
///         None => Page::new(vec![1, 2], Some("2".to_string())),
///         _ => Page::last(vec![3]),
///     })
/// });
/// let items: Vec<u32> = pages.try_collect().await.unwrap();
/// assert_eq!(items, vec![1, 2, 3]);
/// # }
/// ```
pub fn paginate<F, Fut, T, E>(mut fetch: F) -> impl Stream<Item = Result<T, E>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    stream! {
        let mut cursor = None;
        loop {
            match fetch(cursor.take()).await {
                Ok(page) => {
                    for item in page.items {
                        yield Ok(item);
                    }
                    match page.next {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                },
                Err(err) => {
                    yield Err(err);
                    break;
                },
            }
        }
    }
}
