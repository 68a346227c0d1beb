//! Informer event handling
//!
//! Every watched object maps onto the controller's single key. A watch
//! event only enqueues when the object's resourceVersion moved, so resyncs
//! and replayed lists do not cause extra syncs. A relist also counts the
//! objects it no longer contains as deleted.

use crate::controller::queue::WorkQueue;
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct EventHandler {
    queue: Arc<WorkQueue>,
    key: String,
    versions: DashMap<String, String>,
}

impl EventHandler {
    pub fn new(queue: Arc<WorkQueue>, key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            key: key.into(),
            versions: DashMap::new(),
        })
    }

    pub fn handle<K>(&self, event: &watcher::Event<K>)
    where
        K: Resource<DynamicType = ()>,
    {
        match event {
            watcher::Event::Applied(obj) => self.applied(obj),
            watcher::Event::Deleted(obj) => {
                self.versions.remove(&object_id(obj));
                debug!(object = %object_id(obj), "deleted");
                self.queue.add(&self.key);
            }
            watcher::Event::Restarted(objs) => self.restarted(objs),
        }
    }

    /// Deletions that happened while the watch was down only show up as
    /// objects missing from the relist
    fn restarted<K>(&self, objs: &[K])
    where
        K: Resource<DynamicType = ()>,
    {
        let listed: HashSet<String> = objs.iter().map(object_id).collect();
        let prefix = format!("{}/", K::kind(&()));
        let mut gone = 0usize;
        self.versions.retain(|id, _| {
            let keep = !id.starts_with(&prefix) || listed.contains(id);
            if !keep {
                gone += 1;
            }
            keep
        });
        if gone > 0 {
            debug!(kind = %K::kind(&()), gone, "objects removed during watch restart");
            self.queue.add(&self.key);
        }
        for obj in objs {
            self.applied(obj);
        }
    }

    fn applied<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()>,
    {
        let id = object_id(obj);
        let version = obj.meta().resource_version.clone();
        let changed = match &version {
            Some(v) => self.versions.insert(id.clone(), v.clone()).as_ref() != Some(v),
            None => true,
        };
        if changed {
            debug!(object = %id, version = ?version, "changed");
            self.queue.add(&self.key);
        }
    }
}

fn object_id<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}/{}",
        K::kind(&()),
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// Feed a reflector store and the handler from a watch until cancelled
pub async fn watch<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    handler: Arc<EventHandler>,
    shutdown: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    info!(kind = %kind, "starting watch");

    let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => handler.handle(&event),
                Some(Err(e)) => warn!(kind = %kind, error = %e, "watch error"),
                None => break,
            },
        }
    }
    info!(kind = %kind, "watch stopped");
}
