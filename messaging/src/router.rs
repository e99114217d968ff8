use crate::event::Event;
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::*;

pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct Tables {
    /// service name -> owning app id
    services: HashMap<String, String>,
    /// (service, event) -> handler; the empty event name is the catch-all
    events: HashMap<(String, String), Handler>,
    /// pubsub topic -> subscriber
    pubsubs: HashMap<String, Handler>,
}

/// Registration and lookup tables for event dispatch. Apps register at
/// startup; dispatch itself is driven by the engine.
#[derive(Default)]
pub struct Router {
    tables: RwLock<Tables>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a registration for the app with the given id.
    pub fn app(self: &Arc<Self>, id: &str) -> App {
        App {
            router: self.clone(),
            id: id.to_owned(),
            service: None,
        }
    }

    /// Handler for (service, event), falling back to the service catch-all.
    pub fn handler(&self, service: &str, event: &str) -> Option<Handler> {
        let tables = self.tables.read();
        tables
            .events
            .get(&(service.to_owned(), event.to_owned()))
            .or_else(|| tables.events.get(&(service.to_owned(), String::new())))
            .cloned()
    }

    pub fn subscriber(&self, topic: &str) -> Option<Handler> {
        self.tables.read().pubsubs.get(topic).cloned()
    }

    pub fn service_app(&self, service: &str) -> Option<String> {
        self.tables.read().services.get(service).cloned()
    }
}

/// Builder handed out by [`Router::app`]; mirrors the registration calls the
/// apps make at startup: `app(id).service(name)` then `event`/`pubsub`.
pub struct App {
    router: Arc<Router>,
    id: String,
    service: Option<String>,
}

impl App {
    /// Claim a service name for this app. Subsequent `event` registrations
    /// attach to it.
    pub fn service(mut self, name: &str) -> Self {
        let mut claimed = true;
        {
            let mut tables = self.router.tables.write();
            if let Some(owner) = tables.services.get(name) {
                if owner != &self.id {
                    error!(service = name, owner = %owner, app = %self.id, "service already claimed");
                    claimed = false;
                }
            }
            if claimed {
                tables.services.insert(name.to_owned(), self.id.clone());
            }
        }
        if claimed {
            self.service = Some(name.to_owned());
        }
        self
    }

    /// Register a handler for an event of the current service. An empty
    /// event name registers the service catch-all.
    pub fn event(self, name: &str, handler: Handler) -> Self {
        match &self.service {
            Some(service) => {
                self.router
                    .tables
                    .write()
                    .events
                    .insert((service.clone(), name.to_owned()), handler);
            }
            None => error!(app = %self.id, event = name, "event registered before any service"),
        }
        self
    }

    /// Subscribe the app to a pubsub topic.
    pub fn pubsub(self, topic: &str, subscriber: Handler) -> Self {
        self.router.tables.write().pubsubs.insert(topic.to_owned(), subscriber);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Handler {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn exact_handler_wins_over_catch_all() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted: Handler = {
            let hits = hits.clone();
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })
        };
        router
            .app("friends")
            .service("friends")
            .event("invite", counted)
            .event("", noop());

        let handler = router.handler("friends", "invite").unwrap();
        futures::executor::block_on(handler(crate::event::Event::from_frame(Default::default(), None).0)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn catch_all_covers_unknown_events() {
        let router = Router::new();
        router.app("friends").service("friends").event("", noop());
        assert!(router.handler("friends", "whatever").is_some());
        assert!(router.handler("forum", "whatever").is_none());
    }

    #[test]
    fn service_ownership_is_exclusive() {
        let router = Router::new();
        router.app("friends").service("friends");
        router.app("intruder").service("friends");
        assert_eq!(router.service_app("friends").as_deref(), Some("friends"));
    }

    #[test]
    fn pubsub_subscription() {
        let router = Router::new();
        router.app("chat").pubsub("messages/1", noop());
        assert!(router.subscriber("messages/1").is_some());
        assert!(router.subscriber("directory").is_none());
    }
}
