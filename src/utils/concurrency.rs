use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Runs `f` over `items` with at most `limit` futures in flight.
/// Workers pull the next index from a shared counter; results keep input order.
pub async fn map_limit<'a, T, R, F, Fut>(items: &'a [T], limit: usize, f: F) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.is_empty() {
        return Vec::new();
    }
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..items.len()).map(|_| None).collect());
    let workers = limit.clamp(1, items.len());

    {
        let next = &next;
        let slots = &slots;
        let f = &f;
        join_all((0..workers).map(|_| async move {
            loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else {
                    break;
                };
                let result = f(item).await;
                slots.lock().unwrap_or_else(|err| err.into_inner())[index] = Some(result);
            }
        }))
        .await;
    }

    slots
        .into_inner()
        .unwrap_or_else(|err| err.into_inner())
        .into_iter()
        .flatten()
        .collect()
}
