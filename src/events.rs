use crate::dispatcher::{CallbackFuture, Dispatcher};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A registered notification callback. Handlers are async closures; [handler] adapts a plain
///  `async fn`-shaped closure to this signature.
pub type EventHandler<E> = Arc<dyn Fn(E) -> CallbackFuture + Send + Sync>;

/// Adapts an async closure to an [EventHandler].
pub fn handler<E, F, Fut>(f: F) -> EventHandler<E>
where
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Identifies one registration so it can be removed again.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);

/// An ordered set of registered handlers for one notification stream.
///
/// Handlers are invoked once per event, in registration order, through the attached
///  [Dispatcher]. Add and remove are thread safe; a handler removed during a dispatch may
///  still see the event that was in flight.
pub struct HandlerRegistry<E> {
    dispatcher: Arc<dyn Dispatcher>,
    handlers: Mutex<Vec<(HandlerId, EventHandler<E>)>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> HandlerRegistry<E> {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> HandlerRegistry<E> {
        HandlerRegistry {
            dispatcher,
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add(&self, handler: EventHandler<E>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().unwrap().push((id, handler));
        id
    }

    /// returns false if the id was not (or no longer) registered
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let num_before = handlers.len();
        handlers.retain(|(h_id, _)| *h_id != id);
        handlers.len() != num_before
    }

    pub async fn dispatch(&self, event: E) {
        let snapshot: Vec<EventHandler<E>> = self.handlers.lock().unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for h in snapshot {
            self.dispatcher.invoke(h(event.clone())).await;
        }
    }
}
