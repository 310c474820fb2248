// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent for storing, forwarding and delivering bundles.
//!
//! The agent keeps a bounded queue of bundle records and runs one processing
//! worker. For each record the worker tries, in order: expiry, delivery to a
//! locally registered endpoint, and forwarding over the connection the
//! routing provider names for the destination's literal address. A record
//! with no route (or whose forward write failed) is deferred and retried when
//! its timer runs out; a record whose lifetime elapsed is dropped.
//!
//! The worker wakes on every enqueue. With a non-empty queue it sleeps until
//! the nearest deferral deadline; with an empty queue it sleeps until woken.
//!
//! Inbound bundles arrive as single DMP datagrams on port 4556.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::bundle::{endpoint, Bundle, NULL_ENDPOINT};
use crate::bus::{BusContext, DatagramListener};
use crate::protocol::Datagram;
use crate::routing::{NoRouting, RoutingProvider};
use crate::time::{MonotonicTimeProvider, SystemTimeProvider, TimeProvider};
use crate::{Error, Result};

/// Reserved DMP port for bundle traffic.
pub const BUNDLE_PORT: u16 = 4556;

/// Hard cap on queued bundle records.
pub const MAX_BUNDLES: usize = 32;

/// How long a record is deferred before its next forwarding attempt.
pub const DEFER_TIME_MS: i64 = 1000;

/// Record status bit: deferred until `timer`.
const STATUS_DEFER: u32 = 1 << 1;

/// Receiver of bundles delivered to a registered endpoint.
pub trait EndpointListener: Send + Sync {
    fn deliver_bundle(&self, bundle: &Bundle);
}

struct BundleRecord {
    bundle: Bundle,
    status: u32,
    /// Deferral deadline on the agent's local clock, valid while
    /// `STATUS_DEFER` is set.
    timer: i64,
}

struct EndpointRegistration {
    endpoint: String,
    listener: Arc<dyn EndpointListener>,
}

struct AgentState {
    bus: BusContext,
    queue: Mutex<Vec<BundleRecord>>,
    queue_wake: Condvar,
    registrations: StdMutex<Vec<EndpointRegistration>>,
    local_time: Arc<dyn TimeProvider>,
    network_time: StdMutex<Arc<dyn TimeProvider>>,
    routing: StdMutex<Arc<dyn RoutingProvider>>,
    /// Queue length at or above which submissions are dropped. Applies to
    /// every submission path, inbound included; the stricter 100 % check in
    /// the DMP listener only matters once this is raised above the default.
    high_water: AtomicUsize,
    /// (timestamp seconds, last sequence) of the previous local submission.
    last_stamp: StdMutex<(i64, i64)>,
}

impl AgentState {
    fn network_now_millis(&self) -> i64 {
        let provider = Arc::clone(&lock_std(&self.network_time));
        provider.current_time_millis()
    }

    /// Append a record and wake the worker. Silently refuses at the
    /// high-water mark.
    fn queue_bundle(&self, bundle: Bundle) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.high_water.load(Ordering::Relaxed) {
            log::debug!(
                "[bundle] queue at high water ({} records), dropping submission",
                queue.len()
            );
            return Err(Error::QueueFull);
        }
        queue.push(BundleRecord {
            bundle,
            status: 0,
            timer: 0,
        });
        self.queue_wake.notify_all();
        Ok(())
    }

    /// Process one record. Returns `true` when the record must be kept.
    fn process_record(&self, rec: &mut BundleRecord) -> bool {
        let now_local = self.local_time.current_time_millis();
        let now_network = self.network_now_millis();

        // A deferred record sleeps until its timer runs out.
        if rec.status & STATUS_DEFER != 0 {
            if rec.timer > now_local {
                return true;
            }
            rec.status &= !STATUS_DEFER;
        }

        if rec.bundle.timestamp + rec.bundle.lifetime < now_network / 1000 {
            log::debug!(
                "[bundle] lifetime of bundle to {} elapsed, dropping",
                rec.bundle.destination
            );
            return false;
        }

        // Local delivery takes precedence over forwarding, always.
        let local = {
            let registrations = lock_std(&self.registrations);
            registrations
                .iter()
                .find(|r| r.endpoint == rec.bundle.destination)
                .map(|r| Arc::clone(&r.listener))
        };
        if let Some(listener) = local {
            listener.deliver_bundle(&rec.bundle);
            return false;
        }

        // Forwarding needs a literal host address; a hostname cannot be
        // resolved here and makes the bundle permanently undeliverable.
        let dest = match endpoint::host_address(&rec.bundle.destination) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("[bundle] {}, dropping", e);
                return false;
            }
        };

        let next_hop = lock_std(&self.routing).next_hop(&dest);
        if let Some(conn) = next_hop {
            match rec.bundle.to_bytes() {
                Ok(wire) => match Datagram::new(BUNDLE_PORT, wire) {
                    Ok(datagram) => {
                        if self.bus.send(Some(&conn), &datagram).is_ok() {
                            return false;
                        }
                        log::debug!(
                            "[bundle] forward on connection {} failed, deferring",
                            conn.id()
                        );
                    }
                    Err(e) => {
                        log::warn!("[bundle] bundle does not fit a datagram: {}, dropping", e);
                        return false;
                    }
                },
                Err(e) => {
                    log::warn!("[bundle] serialization failed: {}, dropping", e);
                    return false;
                }
            }
        }

        // No route, or the forward write failed: try again later.
        rec.status |= STATUS_DEFER;
        rec.timer = now_local + DEFER_TIME_MS;
        true
    }

    /// One worker pass: process everything, put survivors back, then sleep.
    fn worker_pass(&self, shutdown: &AtomicBool) {
        let drained: Vec<BundleRecord> = std::mem::take(&mut *self.queue.lock());
        let mut survivors: Vec<BundleRecord> = Vec::with_capacity(drained.len());
        for mut rec in drained {
            if self.process_record(&mut rec) {
                survivors.push(rec);
            }
        }

        let mut queue = self.queue.lock();
        // Records enqueued while processing stay behind the survivors.
        let fresh = std::mem::replace(&mut *queue, survivors);
        let fresh_arrivals = !fresh.is_empty();
        queue.extend(fresh);

        if shutdown.load(Ordering::Acquire) || fresh_arrivals {
            // New work arrived mid-pass; go around again immediately.
            return;
        }

        if queue.is_empty() {
            self.queue_wake.wait(&mut queue);
            return;
        }
        // Everything still queued is deferred; sleep to the nearest timer.
        let nearest = queue.iter().map(|r| r.timer).min().unwrap_or(0);
        let sleep = nearest - self.local_time.current_time_millis();
        if sleep > 0 {
            self.queue_wake
                .wait_for(&mut queue, Duration::from_millis(sleep as u64));
        }
    }
}

/// DMP-facing side of the agent; one datagram carries one bundle.
struct AgentDmpService {
    state: Arc<AgentState>,
}

impl DatagramListener for AgentDmpService {
    fn receive_datagram(&self, _conn: Option<&crate::bus::BusConnection>, datagram: &Datagram) {
        // At the hard cap inbound bundles are dropped before parsing.
        if self.state.queue.lock().len() >= MAX_BUNDLES {
            return;
        }
        match Bundle::from_bytes(datagram.payload()) {
            Ok(bundle) => {
                let _ = self.state.queue_bundle(bundle);
            }
            Err(e) => log::debug!("[bundle] malformed inbound bundle: {}", e),
        }
    }
}

/// Handle to a running bundle agent.
///
/// # Examples
/// ```no_run
/// use std::sync::Arc;
/// use meshbus::bundle::{Bundle, BundleAgent, EndpointListener};
/// use meshbus::BusContext;
///
/// struct Echo;
/// impl EndpointListener for Echo {
///     fn deliver_bundle(&self, bundle: &Bundle) {
///         println!("got {} payload octets", bundle.payload.len());
///     }
/// }
///
/// let bus = BusContext::new();
/// let agent = BundleAgent::spawn(bus).unwrap();
/// agent
///     .register_endpoint("dtn://[fd00:0:0:0:0:0:0:1]/echo", Arc::new(Echo))
///     .unwrap();
/// ```
pub struct BundleAgent {
    state: Arc<AgentState>,
    dmp_service: Arc<AgentDmpService>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BundleAgent {
    /// Bind the bundle port on `bus` and start the processing worker.
    ///
    /// Defaults: no routing (everything defers until a provider is set),
    /// system clock as network time, monotonic clock for deferral timers.
    pub fn spawn(bus: BusContext) -> Result<Self> {
        Self::spawn_with_clocks(
            bus,
            Arc::new(MonotonicTimeProvider::new()),
            Arc::new(SystemTimeProvider),
        )
    }

    /// As [`BundleAgent::spawn`] with explicit local and network clocks.
    pub fn spawn_with_clocks(
        bus: BusContext,
        local_time: Arc<dyn TimeProvider>,
        network_time: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let state = Arc::new(AgentState {
            bus: bus.clone(),
            queue: Mutex::new(Vec::new()),
            queue_wake: Condvar::new(),
            registrations: StdMutex::new(Vec::new()),
            local_time,
            network_time: StdMutex::new(network_time),
            routing: StdMutex::new(Arc::new(NoRouting)),
            high_water: AtomicUsize::new((MAX_BUNDLES * 8).div_ceil(10)),
            last_stamp: StdMutex::new((0, 0)),
        });
        let dmp_service = Arc::new(AgentDmpService {
            state: Arc::clone(&state),
        });
        bus.bind(
            Arc::clone(&dmp_service) as Arc<dyn DatagramListener>,
            BUNDLE_PORT,
        )?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                log::info!("[bundle] agent started");
                while !shutdown.load(Ordering::Acquire) {
                    state.worker_pass(&shutdown);
                }
                log::info!("[bundle] agent stopped");
            })
        };
        Ok(Self {
            state,
            dmp_service,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Replace the routing provider consulted when forwarding.
    pub fn set_routing_provider(&self, routing: Arc<dyn RoutingProvider>) {
        *lock_std(&self.state.routing) = routing;
        self.wake();
    }

    /// Replace the network time provider used for bundle timestamps and
    /// expiry. Usually the clock-sync service.
    pub fn set_network_time_provider(&self, time: Arc<dyn TimeProvider>) {
        *lock_std(&self.state.network_time) = time;
    }

    /// Adjust the submission high-water mark (default: 80 % of
    /// [`MAX_BUNDLES`], rounded up). Every submission path drops at this
    /// fill level, locally originated bundles included.
    pub fn set_queue_high_water(&self, records: usize) {
        self.state
            .high_water
            .store(records.min(MAX_BUNDLES), Ordering::Relaxed);
    }

    /// Register `endpoint` for local delivery.
    ///
    /// Fails with [`Error::ReservedEndpoint`] for `dtn:none` and
    /// [`Error::DuplicateEndpoint`] when the endpoint is already registered.
    pub fn register_endpoint(
        &self,
        endpoint: &str,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<()> {
        if endpoint == NULL_ENDPOINT {
            return Err(Error::ReservedEndpoint(endpoint.to_string()));
        }
        let mut registrations = lock_std(&self.state.registrations);
        if registrations.iter().any(|r| r.endpoint == endpoint) {
            return Err(Error::DuplicateEndpoint(endpoint.to_string()));
        }
        registrations.push(EndpointRegistration {
            endpoint: endpoint.to_string(),
            listener,
        });
        drop(registrations);
        // A queued bundle may now be deliverable.
        self.wake();
        Ok(())
    }

    /// Remove the registration for `endpoint` held by `listener`.
    pub fn unregister_endpoint(&self, endpoint: &str, listener: &Arc<dyn EndpointListener>) {
        lock_std(&self.state.registrations).retain(|r| {
            !(r.endpoint == endpoint
                && Arc::as_ptr(&r.listener) as *const () == Arc::as_ptr(listener) as *const ())
        });
    }

    /// Submit a locally originated bundle.
    ///
    /// Stamps the creation timestamp (network seconds) and sequence number
    /// (sequences restart at 0 whenever the timestamp advances), then queues
    /// the bundle for processing. Fails with [`Error::QueueFull`] when the
    /// queue is at the high-water mark.
    pub fn send_bundle(&self, mut bundle: Bundle) -> Result<()> {
        let net_seconds = self.state.network_now_millis() / 1000;
        {
            let mut last = lock_std(&self.state.last_stamp);
            bundle.timestamp = net_seconds;
            if net_seconds == last.0 {
                last.1 += 1;
            } else {
                *last = (net_seconds, 0);
            }
            bundle.sequence = last.1;
        }
        self.state.queue_bundle(bundle)
    }

    /// Number of records currently queued.
    pub fn queue_len(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// Stop the worker and release the bundle port.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn wake(&self) {
        let _queue = self.state.queue.lock();
        self.state.queue_wake.notify_all();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.state.queue.lock();
            self.state.queue_wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let listener = Arc::clone(&self.dmp_service) as Arc<dyn DatagramListener>;
        self.state.bus.unbind(&listener, None);
    }
}

impl Drop for BundleAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::InterfaceAddress;
    use crate::transport::mem;
    use std::sync::atomic::AtomicI64;

    fn test_addr(last: u8) -> InterfaceAddress {
        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        octets[15] = last;
        InterfaceAddress::new(octets)
    }

    fn endpoint_for(addr: InterfaceAddress, service: &str) -> String {
        format!("dtn://[{}]/{}", addr, service)
    }

    struct TickClock(AtomicI64);

    impl TimeProvider for TickClock {
        fn current_time_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Delivered(Mutex<Vec<Bundle>>);

    impl EndpointListener for Delivered {
        fn deliver_bundle(&self, bundle: &Bundle) {
            self.0.lock().push(bundle.clone());
        }
    }

    impl Delivered {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn wait_for(&self, n: usize) -> Vec<Bundle> {
            for _ in 0..400 {
                {
                    let seen = self.0.lock();
                    if seen.len() >= n {
                        return seen.clone();
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }
            self.0.lock().clone()
        }
    }

    fn spawn_agent(bus: &BusContext) -> BundleAgent {
        BundleAgent::spawn_with_clocks(
            bus.clone(),
            Arc::new(MonotonicTimeProvider::new()),
            Arc::new(SystemTimeProvider),
        )
        .unwrap()
    }

    #[test]
    fn test_register_rejects_null_endpoint() {
        let agent = spawn_agent(&BusContext::new());
        assert!(matches!(
            agent.register_endpoint("dtn:none", Delivered::new()),
            Err(Error::ReservedEndpoint(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let agent = spawn_agent(&BusContext::new());
        let ep = endpoint_for(test_addr(1), "echo");
        agent.register_endpoint(&ep, Delivered::new()).unwrap();
        assert!(matches!(
            agent.register_endpoint(&ep, Delivered::new()),
            Err(Error::DuplicateEndpoint(_))
        ));
    }

    #[test]
    fn test_unregister_frees_endpoint() {
        let agent = spawn_agent(&BusContext::new());
        let ep = endpoint_for(test_addr(1), "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();
        let as_dyn: Arc<dyn EndpointListener> = sink;
        agent.unregister_endpoint(&ep, &as_dyn);
        agent.register_endpoint(&ep, Delivered::new()).unwrap();
    }

    #[test]
    fn test_local_delivery() {
        let agent = spawn_agent(&BusContext::new());
        let ep = endpoint_for(test_addr(1), "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();

        let mut bundle = Bundle::new();
        bundle.destination = ep.clone();
        bundle.lifetime = 3600;
        bundle.payload = b"hello".to_vec();
        agent.send_bundle(bundle).unwrap();

        let delivered = sink.wait_for(1);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hello");
        assert_eq!(delivered[0].destination, ep);
        assert_eq!(agent.queue_len(), 0);
    }

    #[test]
    fn test_send_stamps_timestamp_and_sequence() {
        let net = Arc::new(TickClock(AtomicI64::new(5_000_000)));
        let agent = BundleAgent::spawn_with_clocks(
            BusContext::new(),
            Arc::new(MonotonicTimeProvider::new()),
            net.clone(),
        )
        .unwrap();
        let ep = endpoint_for(test_addr(1), "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();

        for _ in 0..3 {
            let mut bundle = Bundle::new();
            bundle.destination = ep.clone();
            bundle.lifetime = 3600;
            agent.send_bundle(bundle).unwrap();
        }
        net.0.store(6_000_000, Ordering::SeqCst);
        let mut bundle = Bundle::new();
        bundle.destination = ep.clone();
        bundle.lifetime = 3600;
        agent.send_bundle(bundle).unwrap();

        let delivered = sink.wait_for(4);
        let stamps: Vec<(i64, i64)> = delivered
            .iter()
            .map(|b| (b.timestamp, b.sequence))
            .collect();
        assert_eq!(
            stamps,
            vec![(5000, 0), (5000, 1), (5000, 2), (6000, 0)]
        );
    }

    #[test]
    fn test_expired_bundle_dropped() {
        let bus = BusContext::new();
        let net = Arc::new(TickClock(AtomicI64::new(10_000_000)));
        let agent = BundleAgent::spawn_with_clocks(
            bus.clone(),
            Arc::new(MonotonicTimeProvider::new()),
            net,
        )
        .unwrap();
        let ep = endpoint_for(test_addr(1), "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();

        // Inject an inbound bundle whose lifetime ended long before the
        // network clock's 10 000 s: it must be dropped, never delivered.
        let mut stale = Bundle::new();
        stale.destination = ep.clone();
        stale.timestamp = 100;
        stale.lifetime = 10;
        let datagram = Datagram::new(BUNDLE_PORT, stale.to_bytes().unwrap()).unwrap();
        bus.send(None, &datagram).unwrap();

        for _ in 0..100 {
            if agent.queue_len() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(agent.queue_len(), 0);
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_no_route_defers() {
        let agent = spawn_agent(&BusContext::new());
        let mut bundle = Bundle::new();
        bundle.destination = endpoint_for(test_addr(7), "far");
        bundle.lifetime = 3600;
        bundle.timestamp = SystemTimeProvider.current_time_millis() / 1000;
        agent.send_bundle(bundle).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(agent.queue_len(), 1);
    }

    #[test]
    fn test_hostname_destination_dropped() {
        let agent = spawn_agent(&BusContext::new());
        let mut bundle = Bundle::new();
        bundle.destination = "dtn://unresolvable-host/echo".into();
        bundle.lifetime = 3600;
        agent.send_bundle(bundle).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(agent.queue_len(), 0);
    }

    #[test]
    fn test_high_water_applies_to_all_submissions() {
        // State without a worker thread, so nothing drains concurrently.
        let state = AgentState {
            bus: BusContext::new(),
            queue: Mutex::new(Vec::new()),
            queue_wake: Condvar::new(),
            registrations: StdMutex::new(Vec::new()),
            local_time: Arc::new(MonotonicTimeProvider::new()),
            network_time: StdMutex::new(Arc::new(SystemTimeProvider)),
            routing: StdMutex::new(Arc::new(NoRouting)),
            high_water: AtomicUsize::new((MAX_BUNDLES * 8).div_ceil(10)),
            last_stamp: StdMutex::new((0, 0)),
        };

        let high_water = (MAX_BUNDLES * 8).div_ceil(10);
        let mut accepted = 0;
        for _ in 0..MAX_BUNDLES + 4 {
            match state.queue_bundle(Bundle::new()) {
                Ok(()) => accepted += 1,
                Err(Error::QueueFull) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // 80 % of 32 is 25.6: the 26th record tips the queue over.
        assert_eq!(high_water, 26);
        assert_eq!(accepted, high_water);
        assert_eq!(state.queue.lock().len(), high_water);
    }

    #[test]
    fn test_high_water_tunable() {
        let agent = spawn_agent(&BusContext::new());
        agent.set_queue_high_water(0);
        let mut bundle = Bundle::new();
        bundle.destination = endpoint_for(test_addr(7), "far");
        bundle.lifetime = 3600;
        assert!(matches!(agent.send_bundle(bundle), Err(Error::QueueFull)));

        // Restoring the mark admits bundles again.
        agent.set_queue_high_water(MAX_BUNDLES);
        let mut bundle = Bundle::new();
        bundle.destination = endpoint_for(test_addr(7), "far");
        bundle.lifetime = 3600;
        agent.send_bundle(bundle).unwrap();
    }

    #[test]
    fn test_inbound_dmp_bundle_delivered() {
        let bus = BusContext::new();
        let agent = spawn_agent(&bus);
        let ep = endpoint_for(test_addr(1), "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();

        let mut bundle = Bundle::new();
        bundle.destination = ep.clone();
        bundle.lifetime = 3600;
        bundle.timestamp = SystemTimeProvider.current_time_millis() / 1000;
        bundle.payload = b"from afar".to_vec();
        let datagram = Datagram::new(BUNDLE_PORT, bundle.to_bytes().unwrap()).unwrap();
        bus.send(None, &datagram).unwrap();

        let delivered = sink.wait_for(1);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], bundle);
    }

    #[test]
    fn test_malformed_inbound_ignored() {
        let bus = BusContext::new();
        let agent = spawn_agent(&bus);
        let datagram = Datagram::new(BUNDLE_PORT, vec![0xff, 0x00, 0x01]).unwrap();
        bus.send(None, &datagram).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(agent.queue_len(), 0);
    }

    #[test]
    fn test_forward_over_route() {
        let bus = BusContext::new();
        let agent = spawn_agent(&bus);

        let dest_addr = test_addr(9);
        let (conn, peer) = mem::link_pair(test_addr(1), dest_addr);

        struct FixedRoute(InterfaceAddress, crate::bus::BusConnection);
        impl RoutingProvider for FixedRoute {
            fn next_hop(&self, dest: &InterfaceAddress) -> Option<crate::bus::BusConnection> {
                (*dest == self.0).then(|| self.1.clone())
            }
        }
        agent.set_routing_provider(Arc::new(FixedRoute(dest_addr, conn.clone())));

        let mut bundle = Bundle::new();
        bundle.destination = endpoint_for(dest_addr, "echo");
        bundle.lifetime = 3600;
        bundle.payload = b"forward me".to_vec();
        agent.send_bundle(bundle.clone()).unwrap();

        let datagram = peer.read_datagram().unwrap();
        assert_eq!(datagram.port(), BUNDLE_PORT);
        let forwarded = Bundle::from_bytes(datagram.payload()).unwrap();
        assert_eq!(forwarded.payload, b"forward me");
        assert_eq!(forwarded.destination, bundle.destination);

        for _ in 0..100 {
            if agent.queue_len() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(agent.queue_len(), 0);

        conn.disconnect();
    }

    #[test]
    fn test_defer_then_forward_when_route_appears() {
        let bus = BusContext::new();
        let agent = spawn_agent(&bus);

        let dest_addr = test_addr(9);
        let mut bundle = Bundle::new();
        bundle.destination = endpoint_for(dest_addr, "echo");
        bundle.lifetime = 3600;
        bundle.payload = b"late".to_vec();
        agent.send_bundle(bundle).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(agent.queue_len(), 1);

        let (conn, peer) = mem::link_pair(test_addr(1), dest_addr);
        struct FixedRoute(InterfaceAddress, crate::bus::BusConnection);
        impl RoutingProvider for FixedRoute {
            fn next_hop(&self, dest: &InterfaceAddress) -> Option<crate::bus::BusConnection> {
                (*dest == self.0).then(|| self.1.clone())
            }
        }
        agent.set_routing_provider(Arc::new(FixedRoute(dest_addr, conn.clone())));

        // The deferred record retries within DEFER_TIME_MS of the route
        // appearing.
        let datagram = peer.read_datagram().unwrap();
        let forwarded = Bundle::from_bytes(datagram.payload()).unwrap();
        assert_eq!(forwarded.payload, b"late");

        conn.disconnect();
    }

    #[test]
    fn test_local_delivery_beats_forwarding() {
        let bus = BusContext::new();
        let agent = spawn_agent(&bus);

        let dest_addr = test_addr(9);
        let ep = endpoint_for(dest_addr, "echo");
        let sink = Delivered::new();
        agent.register_endpoint(&ep, sink.clone()).unwrap();

        // A route to the destination exists, but local delivery must win.
        let (conn, peer) = mem::link_pair(test_addr(1), dest_addr);
        struct AlwaysRoute(crate::bus::BusConnection);
        impl RoutingProvider for AlwaysRoute {
            fn next_hop(&self, _dest: &InterfaceAddress) -> Option<crate::bus::BusConnection> {
                Some(self.0.clone())
            }
        }
        agent.set_routing_provider(Arc::new(AlwaysRoute(conn.clone())));

        let mut bundle = Bundle::new();
        bundle.destination = ep.clone();
        bundle.lifetime = 3600;
        agent.send_bundle(bundle).unwrap();

        assert_eq!(sink.wait_for(1).len(), 1);
        // Nothing went over the wire: the peer sees the link close, not data.
        conn.disconnect();
        assert!(peer.read_datagram().is_err());
    }
}
