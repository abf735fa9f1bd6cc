//! Per-guest lifecycle: bind reads configuration and publishes feature
//! flags, drives the Request Engine's loop for as long as the frontend is
//! connected, and tears down cache/ring/image in order on close.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::Engine;
use crate::evtchn::EventChannel;
use crate::gnttab::GrantMap;
use crate::grant_cache::GrantCache;
use crate::image::ImageStore;
use crate::ring::Ring;
use crate::wire::Request;
use crate::xenstore::{strip_one_quote_pair, Store};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading frontend config: {0}")]
    Config(#[source] crate::xenstore::Error),
    #[error("config value {value:?} is not a valid grant/port number: {source}")]
    BadConfigValue {
        value: String,
        source: std::num::ParseIntError,
    },
    #[error("opening image: {0}")]
    Image(#[source] crate::image::Error),
    #[error("publishing feature flags: {0}")]
    Publish(#[source] crate::xenstore::Error),
    #[error("mapping ring-ref: {0}")]
    Ring(#[source] crate::grant_cache::Error),
    #[error("binding event channel: {0}")]
    EventChannel(#[source] crate::evtchn::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
}

/// One connected guest's block device: its ring, its persistent grant
/// cache, and the image it serves I/O against. Owned exclusively by the
/// worker that drives `serve()`, no interior mutability, per the Design
/// Notes ("the ring worker is the only accessor").
pub struct Frontend<M: GrantMap, E: EventChannel> {
    pub id: u64,
    ring: Ring,
    ring_gref: u32,
    ring_page: *mut u8,
    engine: Engine<M>,
    evtchn: E,
    last_notified_rsp_prod: u32,
    metrics: Metrics,
}

/// The fixed feature-flag table this backend advertises on every bind.
pub const FEATURE_TABLE: &[(&str, &str)] = &[
    ("feature-max-indirect-segments", "256"),
    ("feature-discard", "0"),
    ("feature-persistent", "1"),
    ("feature-flush-cache", "1"),
    ("feature-barrier", "1"),
];

impl<M: GrantMap, E: EventChannel> Frontend<M, E> {
    /// Reads `{frontend_path}/event-channel` and `{frontend_path}/ring-ref`
    /// and uses them for real: `ring-ref` is mapped through `cache_map` to
    /// obtain the ring's control page, and `event-channel` is handed to
    /// `bind_evtchn` to construct this frontend's notification collaborator
    /// (e.g. `|port| EvtChnHandle::bind(remote_domain, port)`).
    pub fn bind<S: Store>(
        id: u64,
        store: &mut S,
        frontend_path: &str,
        backend_path: &str,
        cache_map: M,
        bind_evtchn: impl FnOnce(u32) -> Result<E, crate::evtchn::Error>,
    ) -> Result<Frontend<M, E>, Error> {
        let event_channel_str = store
            .read(&format!("{frontend_path}/event-channel"))
            .map_err(Error::Config)?;
        let event_channel: u32 =
            event_channel_str
                .parse()
                .map_err(|source| Error::BadConfigValue {
                    value: event_channel_str.clone(),
                    source,
                })?;

        let ring_ref_str = store
            .read(&format!("{frontend_path}/ring-ref"))
            .map_err(Error::Config)?;
        let ring_ref: u32 = ring_ref_str
            .parse()
            .map_err(|source| Error::BadConfigValue {
                value: ring_ref_str.clone(),
                source,
            })?;

        let params = store
            .read(&format!("{backend_path}/params"))
            .map_err(Error::Config)?;
        let image_path = strip_one_quote_pair(&params);

        let image = ImageStore::open(std::path::Path::new(image_path)).map_err(Error::Image)?;

        for (key, value) in FEATURE_TABLE {
            store
                .write(&format!("{backend_path}/{key}"), value)
                .map_err(Error::Publish)?;
        }
        store
            .write(&format!("{backend_path}/sectors"), &image.sector_count().to_string())
            .map_err(Error::Publish)?;
        store
            .write(&format!("{backend_path}/sector-size"), "512")
            .map_err(Error::Publish)?;
        store
            .write(&format!("{backend_path}/info"), "0")
            .map_err(Error::Publish)?;

        let mut cache = GrantCache::new(cache_map);
        // The ring's control page is itself a persistent grant, but it must
        // never be evicted while the frontend is live, so it's mapped
        // directly rather than through `get_or_map`'s LRU index.
        let ring_page = cache.map_untracked(ring_ref).map_err(Error::Ring)?;
        let ring = unsafe { Ring::new(ring_page, crate::wire::PAGE_SIZE) };

        let evtchn = bind_evtchn(event_channel).map_err(Error::EventChannel)?;

        let engine = Engine::new(cache, image);

        Ok(Frontend {
            id,
            ring,
            ring_gref: ring_ref,
            ring_page,
            engine,
            evtchn,
            last_notified_rsp_prod: 0,
            metrics: Metrics::default(),
        })
    }

    /// Drain every request currently on the ring, processing each serially
    /// and posting its response. Returns the number of requests processed.
    /// A notification is posted only if the frontend's event index says
    /// it's still waiting on responses since the last one (mirroring
    /// `vring.needs_notification()` in the vhost-user teacher).
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Some(raw) = self.ring.pop_request() {
            let req = Request::decode(&raw);
            let id = req.id(&raw);
            match &req {
                Request::Read(_) => self.metrics.reads += 1,
                Request::Write(_) => self.metrics.writes += 1,
                _ => {}
            }
            let resp = self.engine.process(req, id);
            self.ring.push_response(resp);
            self.metrics.requests += 1;
            count += 1;
        }
        if count > 0 {
            if self.ring.needs_notification(self.last_notified_rsp_prod) {
                if let Err(e) = self.evtchn.notify() {
                    log::warn!("frontend {}: notify failed: {e}", self.id);
                }
            }
            self.last_notified_rsp_prod = self.ring.rsp_prod();
        }
        count
    }

    /// The engine's serial loop: wait for a notification, drain, repeat,
    /// until `stop` is set. Teardown (dropping this `Frontend`, which drops
    /// the ring, cache, and image in field-declaration order) happens when
    /// the caller drops the returned value after this returns.
    pub fn serve(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = self.evtchn.wait() {
                log::warn!("frontend {}: event wait failed: {e}", self.id);
                break;
            }
            self.drain();
        }
        // A close can race a notification; drain once more so no request
        // the frontend already produced is left unanswered.
        self.drain();
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }
}

impl<M: GrantMap, E: EventChannel> Drop for Frontend<M, E> {
    fn drop(&mut self) {
        log::info!(
            "frontend {}: closing, {} requests ({} reads, {} writes)",
            self.id,
            self.metrics.requests,
            self.metrics.reads,
            self.metrics.writes
        );
        if let Err(e) = self.engine.cache_mut().unmap_untracked(self.ring_gref, self.ring_page) {
            log::warn!("frontend {}: unmapping ring page failed: {e}", self.id);
        }
    }
}
