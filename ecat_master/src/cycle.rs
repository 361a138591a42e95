//! Cyclic exchange engine: receive → exchange → send, once per period.
//!
//! Runs on a dedicated thread for the lifetime of a session:
//!
//! ## RT Setup Sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)` - lock all pages.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity` - pin to the configured CPU core.
//! 4. `sched_setscheduler(SCHED_FIFO)` - RT priority.
//!
//! All four are no-ops without the `rt` feature. A failure is logged and the
//! loop runs without the guarantee.
//!
//! ## Cycle Body
//! 1. receive, process domain, check domain health
//! 2. throttled slow path: master and per-device state refresh
//! 3. only while the master reports OP: encode outputs, decode all entries
//! 4. queue domain, send
//!
//! ## Pacing
//! Absolute deadlines on `CLOCK_MONOTONIC`, advanced by the period read at
//! every cycle so `set_period` takes effect on the next wake. A stop request
//! or a failed sleep moves the engine to draining: deactivate, wait for the
//! OP bit to clear (bounded by the drain timeout), release the master.

use crate::session::{CycleState, SharedDomain};
use ecat_common::consts::{LATENCY_WINDOW, MAX_SAFE_STACK};
use ecat_common::driver::MasterDriver;
use ecat_common::state::{AlState, DomainState, MasterState};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised by the cycle plumbing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    /// RT setup step failed.
    #[error("RT setup failed: {0}")]
    RtSetup(String),

    /// Clock read or absolute sleep failed.
    #[error("Clock error: {0}")]
    Clock(String),
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
///
/// Updated every cycle with no allocation.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Last cycle body duration [ns].
    pub last_cycle_ns: i64,
    /// Minimum cycle body duration [ns].
    pub min_cycle_ns: i64,
    /// Maximum cycle body duration [ns].
    pub max_cycle_ns: i64,
    /// Running sum for average computation.
    pub sum_cycle_ns: i64,
    /// Cycles whose body ran past the period.
    pub overruns: u64,
    /// Maximum wake-up latency [ns] (time between deadline and actual wake).
    pub max_latency_ns: i64,
}

impl CycleStats {
    /// Create a new zeroed stats instance.
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: i64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            overruns: 0,
            max_latency_ns: 0,
        }
    }

    /// Record a cycle duration. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: i64, latency_ns: i64, period_ns: i64) {
        self.cycle_count += 1;
        self.last_cycle_ns = duration_ns;
        self.min_cycle_ns = self.min_cycle_ns.min(duration_ns);
        self.max_cycle_ns = self.max_cycle_ns.max(duration_ns);
        self.sum_cycle_ns += duration_ns;
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
        if duration_ns > period_ns {
            self.overruns += 1;
        }
    }

    /// Average cycle time [ns] (returns 0 if no cycles).
    #[inline]
    pub fn avg_cycle_ns(&self) -> i64 {
        if self.cycle_count == 0 {
            0
        } else {
            self.sum_cycle_ns / self.cycle_count as i64
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Moving averages of the interval between two cycles (latency) and of the
/// absolute difference between two consecutive intervals (jitter).
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    last: Option<u64>,
    latency: MovingAverage,
    jitter: MovingAverage,
}

impl LatencyStats {
    /// Feed one measured interval. The first sample only primes the jitter
    /// reference.
    pub fn record(&mut self, interval_ns: u64) {
        let Some(last) = self.last.replace(interval_ns) else {
            return;
        };
        self.jitter.add(last.abs_diff(interval_ns));
        self.latency.add(interval_ns);
    }

    /// Average interval [ns].
    pub fn latency_ns(&self) -> u64 {
        self.latency.value()
    }

    /// Average jitter [ns].
    pub fn jitter_ns(&self) -> u64 {
        self.jitter.value()
    }
}

#[derive(Debug, Clone, Default)]
struct MovingAverage {
    samples: VecDeque<u64>,
    sum: u64,
}

impl MovingAverage {
    fn add(&mut self, sample: u64) {
        if self.samples.len() == LATENCY_WINDOW {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    fn value(&self) -> u64 {
        match self.samples.len() {
            0 => 0,
            n => self.sum / n as u64,
        }
    }
}

// ─── Reports ────────────────────────────────────────────────────────

/// Passed to the per-cycle callback after transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// Aggregate device states from the last slow-path refresh.
    pub al_states: AlState,
    /// The aggregate state changed this cycle.
    pub state_changed: bool,
    /// Values were exchanged this cycle.
    pub operational: bool,
    /// Interval since the previous cycle [ns].
    pub latency_ns: u64,
    /// Domain health after this cycle's receive.
    pub domain: DomainState,
}

/// Per-cycle callback.
pub type CycleCallback = Box<dyn FnMut(&CycleReport) + Send>;

/// Engine parameters fixed for a session, plus the live period.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    /// Period in nanoseconds, shared with `EcatMaster::set_period`.
    pub period_ns: Arc<AtomicU64>,
    /// Interval between slow-path refreshes.
    pub health_interval: Duration,
    /// Upper bound on the drain phase.
    pub drain_timeout: Duration,
    /// Minimum interval between two operational reports.
    pub data_interval: Duration,
    /// SCHED_FIFO priority (`rt` feature); `None` selects the maximum.
    pub rt_priority: Option<i32>,
    /// CPU core to pin to (`rt` feature).
    pub cpu_core: Option<usize>,
}

impl CycleSettings {
    fn period_ns(&self) -> u64 {
        self.period_ns.load(Ordering::Relaxed).max(1)
    }

    /// Cycles between two slow-path refreshes at the current period.
    fn cycles_per_check(&self) -> u64 {
        (self.health_interval.as_nanos() as u64 / self.period_ns()).max(1)
    }
}

// ─── Engine ─────────────────────────────────────────────────────────

/// State kept by the cyclic thread between cycles.
pub struct CycleEngine {
    shared: Arc<SharedDomain>,
    settings: CycleSettings,
    callback: CycleCallback,
    countdown: u64,
    cycles: u64,
    stats: CycleStats,
    latency: LatencyStats,
    last_start: Option<Instant>,
    last_report: Option<Instant>,
    exchange_failures: usize,
}

/// What one cycle observed, evaluated outside the driver lock.
struct CycleOutcome {
    state_changed: bool,
    operational: bool,
}

impl CycleEngine {
    pub fn new(shared: Arc<SharedDomain>, settings: CycleSettings, callback: CycleCallback) -> Self {
        Self {
            shared,
            settings,
            callback,
            countdown: 0,
            cycles: 0,
            stats: CycleStats::new(),
            latency: LatencyStats::default(),
            last_start: None,
            last_report: None,
            exchange_failures: 0,
        }
    }

    /// Timing statistics so far.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Thread body: RT setup, period loop, drain.
    pub fn run(mut self) -> CycleStats {
        if let Err(e) = rt_setup(self.settings.cpu_core, self.settings.rt_priority) {
            warn!("{e}; continuing without RT guarantees");
        }

        self.shared.set_cycle_state(CycleState::Running);
        info!(
            "Cyclic exchange running: period {} ns, {} entries",
            self.settings.period_ns(),
            self.shared.raw_table().len()
        );

        match Deadline::start(self.settings.period_ns()) {
            Ok(mut deadline) => loop {
                if let Err(e) = deadline.wait() {
                    warn!("Period wait failed: {e}");
                    break;
                }
                if self.shared.stop_requested() {
                    info!("Stop requested");
                    break;
                }
                let wake_latency = deadline.lateness_ns();
                let started = Instant::now();
                self.cycle_once();
                let duration = started.elapsed().as_nanos() as i64;
                self.stats
                    .record(duration, wake_latency, self.settings.period_ns() as i64);
                deadline.advance(self.settings.period_ns());
            },
            Err(e) => error!("Cannot start period timer: {e}"),
        }

        self.drain();
        info!(
            "Cyclic exchange stopped after {} cycles (avg {} ns, max {} ns, {} overruns)",
            self.stats.cycle_count,
            self.stats.avg_cycle_ns(),
            self.stats.max_cycle_ns,
            self.stats.overruns
        );
        self.stats
    }

    /// One exchange cycle.
    pub fn cycle_once(&mut self) {
        let now = Instant::now();
        let interval = self.last_start.map(|t| now.duration_since(t).as_nanos() as u64);
        self.last_start = Some(now);

        let shared = Arc::clone(&self.shared);
        let outcome = {
            let mut driver = shared.driver();
            self.exchange(&mut **driver)
        };

        if let Some(interval) = interval {
            self.latency.record(interval);
        }
        self.cycles += 1;
        let cycle = self.cycles;
        self.shared
            .publish_stats(cycle, self.latency.latency_ns(), self.latency.jitter_ns());
        self.report(cycle, interval.unwrap_or(0), outcome, now);
    }

    /// Driver-side part of a cycle, under the driver lock.
    fn exchange(&mut self, driver: &mut dyn MasterDriver) -> CycleOutcome {
        driver.receive();
        driver.domain_process();
        self.check_domain(driver.domain_state());

        let mut state_changed = false;
        if self.countdown == 0 {
            self.countdown = self.settings.cycles_per_check();
            state_changed = self.refresh_master(driver);
            self.refresh_devices(driver);
        }
        self.countdown -= 1;

        let operational = self.shared.master_state().al_states.is_operational();
        if operational {
            let failures = self.shared.raw_table().exchange(driver.domain_data());
            if failures != self.exchange_failures {
                if failures > 0 {
                    warn!("{failures} entries fall outside the domain buffer");
                }
                self.exchange_failures = failures;
            }
        }

        driver.domain_queue();
        driver.send();
        CycleOutcome { state_changed, operational }
    }

    fn check_domain(&self, state: DomainState) {
        let last = self.shared.domain_state();
        if state == last {
            return;
        }
        if state.working_counter != last.working_counter {
            debug!("Domain: working counter {}", state.working_counter);
        }
        if state.wc_state != last.wc_state {
            warn!("Domain: wc state {:?}", state.wc_state);
        }
        self.shared.set_domain_state(state);
    }

    /// Refresh the aggregate state; returns whether the AL states changed.
    fn refresh_master(&self, driver: &dyn MasterDriver) -> bool {
        let state = driver.master_state();
        let last = self.shared.master_state();
        if state == last {
            return false;
        }
        if state.slaves_responding != last.slaves_responding {
            info!("{} device(s) responding", state.slaves_responding);
        }
        if state.al_states != last.al_states {
            info!("AL states: {}", state.al_states);
        }
        if state.link_up != last.link_up {
            if state.link_up {
                info!("Link is up");
            } else {
                warn!("Link is down");
            }
        }
        self.shared.set_master_state(state);
        state.al_states != last.al_states
    }

    fn refresh_devices(&self, driver: &dyn MasterDriver) {
        for slot in self.shared.devices() {
            let record = slot.record();
            let state = match driver.slave_config_state(record.handle) {
                Ok(state) => state,
                Err(e) => {
                    debug!("Device {}: state unavailable: {e}", record.position);
                    continue;
                }
            };
            let last = slot.state();
            if state == last {
                continue;
            }
            if state.al_state != last.al_state {
                info!("Device {}: state {}", record.position, state.al_state);
            }
            if state.online != last.online {
                if state.online {
                    info!("Device {}: online", record.position);
                } else {
                    warn!("Device {}: offline", record.position);
                }
            }
            if state.operational != last.operational {
                info!(
                    "Device {}: {}operational",
                    record.position,
                    if state.operational { "" } else { "not " }
                );
            }
            slot.set_state(state);
        }
    }

    /// Invoke the callback on state changes, and on operational cycles at
    /// most once per data interval.
    fn report(&mut self, cycle: u64, latency_ns: u64, outcome: CycleOutcome, now: Instant) {
        let due = outcome.operational
            && self
                .last_report
                .is_none_or(|t| now.duration_since(t) >= self.settings.data_interval);
        if !outcome.state_changed && !due {
            return;
        }
        if due {
            self.last_report = Some(now);
        }
        let report = CycleReport {
            cycle,
            al_states: self.shared.master_state().al_states,
            state_changed: outcome.state_changed,
            operational: outcome.operational,
            latency_ns,
            domain: self.shared.domain_state(),
        };
        (self.callback)(&report);
    }

    /// Deactivate, wait for OP to clear, release the master.
    fn drain(&mut self) {
        self.shared.set_cycle_state(CycleState::Draining);
        info!("Draining: deactivating master");

        let deadline = Instant::now() + self.settings.drain_timeout;
        self.shared.driver().deactivate();
        loop {
            let state: MasterState = self.shared.driver().master_state();
            self.shared.set_master_state(state);
            if !state.al_states.is_operational() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Devices still report OP after {:?}; releasing anyway",
                    self.settings.drain_timeout
                );
                break;
            }
            std::thread::sleep(Duration::from_nanos(self.settings.period_ns()));
        }

        self.shared.driver().release();
        self.shared.set_cycle_state(CycleState::Stopped);
        info!("Master released");
    }
}

// ─── Absolute-deadline timer ────────────────────────────────────────

/// Periodic absolute wake-up on `CLOCK_MONOTONIC`.
#[cfg(feature = "rt")]
struct Deadline {
    next: nix::sys::time::TimeSpec,
}

#[cfg(feature = "rt")]
impl Deadline {
    /// First wake one period from now.
    fn start(period_ns: u64) -> Result<Self, CycleError> {
        let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map_err(|e| CycleError::Clock(format!("clock_gettime: {e}")))?;
        Ok(Self { next: timespec_add_ns(now, period_ns as i64) })
    }

    fn wait(&self) -> Result<(), CycleError> {
        use nix::errno::Errno;
        use nix::time::{ClockId, ClockNanosleepFlags, clock_nanosleep};
        loop {
            match clock_nanosleep(
                ClockId::CLOCK_MONOTONIC,
                ClockNanosleepFlags::TIMER_ABSTIME,
                &self.next,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(CycleError::Clock(format!("clock_nanosleep: {e}"))),
            }
        }
    }

    fn lateness_ns(&self) -> i64 {
        nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(|now| timespec_diff_ns(&now, &self.next).max(0))
            .unwrap_or(0)
    }

    fn advance(&mut self, period_ns: u64) {
        self.next = timespec_add_ns(self.next, period_ns as i64);
    }
}

/// Periodic absolute wake-up on the monotonic `Instant` clock.
#[cfg(not(feature = "rt"))]
struct Deadline {
    next: Instant,
}

#[cfg(not(feature = "rt"))]
impl Deadline {
    /// First wake one period from now.
    fn start(period_ns: u64) -> Result<Self, CycleError> {
        Ok(Self { next: Instant::now() + Duration::from_nanos(period_ns) })
    }

    fn wait(&self) -> Result<(), CycleError> {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        }
        Ok(())
    }

    fn lateness_ns(&self) -> i64 {
        Instant::now().saturating_duration_since(self.next).as_nanos() as i64
    }

    fn advance(&mut self, period_ns: u64) {
        self.next += Duration::from_nanos(period_ns);
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Scheduling calls for the cyclic thread. Without the `rt` feature every
/// call succeeds without touching the system.
#[cfg(feature = "rt")]
mod sched {
    use super::CycleError;
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::sys::mman::{MlockallFlags, mlockall};
    use nix::unistd::Pid;

    pub(super) fn lock_memory() -> Result<(), CycleError> {
        mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
            .map_err(|e| CycleError::RtSetup(format!("cannot lock process memory: {e}")))
    }

    pub(super) fn pin_to_core(cpu: usize) -> Result<(), CycleError> {
        let mut cores = CpuSet::new();
        cores
            .set(cpu)
            .map_err(|e| CycleError::RtSetup(format!("core {cpu} not addressable: {e}")))?;
        sched_setaffinity(Pid::from_raw(0), &cores)
            .map_err(|e| CycleError::RtSetup(format!("cannot pin cyclic thread to core {cpu}: {e}")))
    }

    /// SCHED_FIFO at `priority`, or at the highest FIFO priority.
    pub(super) fn fifo(priority: Option<i32>) -> Result<i32, CycleError> {
        // SAFETY: no pointer arguments.
        let priority =
            priority.unwrap_or_else(|| unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) });
        let param = libc::sched_param { sched_priority: priority };
        // SAFETY: `param` is live for the call; pid 0 is the calling thread.
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
            return Err(CycleError::RtSetup(format!(
                "cannot switch cyclic thread to SCHED_FIFO {priority}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(priority)
    }
}

#[cfg(not(feature = "rt"))]
mod sched {
    use super::CycleError;

    pub(super) fn lock_memory() -> Result<(), CycleError> {
        Ok(())
    }

    pub(super) fn pin_to_core(_cpu: usize) -> Result<(), CycleError> {
        Ok(())
    }

    pub(super) fn fifo(priority: Option<i32>) -> Result<i32, CycleError> {
        Ok(priority.unwrap_or(0))
    }
}

/// Write every byte of a `MAX_SAFE_STACK` frame so the loop never takes a
/// stack page fault.
fn touch_stack() {
    let mut frame = [0u8; MAX_SAFE_STACK];
    for byte in frame.iter_mut() {
        // SAFETY: `byte` is an exclusively borrowed stack location.
        unsafe { std::ptr::write_volatile(byte, 0xFF) };
    }
    std::hint::black_box(&frame);
}

/// Prepare the calling thread for cyclic exchange: locked memory, touched
/// stack, optional core pinning, FIFO scheduling.
pub fn rt_setup(cpu_core: Option<usize>, rt_priority: Option<i32>) -> Result<(), CycleError> {
    sched::lock_memory()?;
    touch_stack();
    if let Some(cpu) = cpu_core {
        sched::pin_to_core(cpu)?;
    }
    let priority = sched::fifo(rt_priority)?;
    debug!("Cyclic thread prepared: core {cpu_core:?}, FIFO priority {priority}");
    Ok(())
}

// ─── Time Helpers ───────────────────────────────────────────────────

/// Add nanoseconds to a TimeSpec, carrying into seconds.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

/// Compute the difference (a - b) in nanoseconds.
#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainTable;
    use crate::drivers::simulation::{SimulationConfig, SimulationDriver};
    use crate::sequencer::configure_devices;
    use ecat_common::codec::PdoEntryOffset;
    use ecat_common::entry::{Direction, RuntimeEntry};
    use std::sync::Mutex;

    #[test]
    fn cycle_stats_basic() {
        let mut stats = CycleStats::new();
        assert_eq!(stats.cycle_count, 0);
        assert_eq!(stats.avg_cycle_ns(), 0);

        stats.record(500_000, 1_000, 1_000_000);
        stats.record(300_000, 4_000, 1_000_000);
        stats.record(1_200_000, 2_000, 1_000_000);
        assert_eq!(stats.cycle_count, 3);
        assert_eq!(stats.last_cycle_ns, 1_200_000);
        assert_eq!(stats.min_cycle_ns, 300_000);
        assert_eq!(stats.max_cycle_ns, 1_200_000);
        assert_eq!(stats.avg_cycle_ns(), 666_666);
        assert_eq!(stats.max_latency_ns, 4_000);
        assert_eq!(stats.overruns, 1);
    }

    #[test]
    fn latency_first_sample_primes() {
        let mut stats = LatencyStats::default();
        stats.record(1_000_000);
        assert_eq!(stats.latency_ns(), 0);
        assert_eq!(stats.jitter_ns(), 0);

        stats.record(1_010_000);
        stats.record(990_000);
        assert_eq!(stats.latency_ns(), 1_000_000);
        assert_eq!(stats.jitter_ns(), 15_000);
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut stats = LatencyStats::default();
        stats.record(100);
        for _ in 0..LATENCY_WINDOW {
            stats.record(100);
        }
        for _ in 0..LATENCY_WINDOW {
            stats.record(200);
        }
        assert_eq!(stats.latency_ns(), 200);
    }

    #[test]
    fn rt_setup_without_affinity_succeeds_in_simulation() {
        #[cfg(not(feature = "rt"))]
        assert!(rt_setup(None, None).is_ok());
    }

    #[cfg(feature = "rt")]
    #[test]
    fn timespec_add_carries() {
        let ts = nix::sys::time::TimeSpec::new(1, 999_999_500);
        let next = timespec_add_ns(ts, 1_000);
        assert_eq!(next.tv_sec(), 2);
        assert_eq!(next.tv_nsec(), 500);
        assert_eq!(timespec_diff_ns(&next, &ts), 1_000);
    }

    fn settings(health_ms: u64) -> CycleSettings {
        CycleSettings {
            period_ns: Arc::new(AtomicU64::new(1_000_000)),
            health_interval: Duration::from_millis(health_ms),
            drain_timeout: Duration::from_millis(100),
            data_interval: Duration::ZERO,
            rt_priority: None,
            cpu_core: None,
        }
    }

    fn engine(health_ms: u64) -> (CycleEngine, Arc<SharedDomain>, Arc<Mutex<Vec<CycleReport>>>) {
        let mut driver = SimulationDriver::new(SimulationConfig {
            activation_cycles: 2,
            ..SimulationConfig::default()
        });
        driver.request_master(0).unwrap();
        let entry = RuntimeEntry {
            position: 0,
            sync_index: 2,
            pdo_index: 0x1600,
            index: 0x7000,
            subindex: 1,
            bit_len: 8,
            add_to_domain: true,
            direction: Direction::Output,
            ..RuntimeEntry::default()
        };
        let devices = configure_devices(&mut driver, std::slice::from_ref(&entry)).unwrap();
        driver.create_domain().unwrap();
        let regs = [ecat_common::driver::PdoEntryRegistration {
            slave: devices.records[0].identity(),
            index: 0x7000,
            subindex: 1,
        }];
        driver.register_pdo_entries(&regs).unwrap();
        driver.activate().unwrap();

        let table = DomainTable::from_parts(vec![(entry, PdoEntryOffset::at_byte(0))]);
        let shared = Arc::new(SharedDomain::new(table, devices, Box::new(driver)));
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let engine = CycleEngine::new(
            Arc::clone(&shared),
            settings(health_ms),
            Box::new(move |r: &CycleReport| sink.lock().unwrap().push(*r)),
        );
        (engine, shared, reports)
    }

    #[test]
    fn first_cycle_refreshes_state() {
        let (mut engine, shared, reports) = engine(1000);
        engine.cycle_once();
        assert_eq!(shared.master_state().slaves_responding, 1);
        assert_eq!(shared.master_state().al_states, AlState::SAFEOP);
        assert_eq!(shared.devices()[0].state().al_state, AlState::SAFEOP);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].state_changed);
        assert!(!reports[0].operational);
    }

    #[test]
    fn outputs_encoded_only_when_operational() {
        let (mut engine, shared, _) = engine(1);
        shared.table().unwrap().write_slot(0, 0x5A).unwrap();

        engine.cycle_once();
        assert_eq!(shared.driver().domain_data()[0], 0);

        engine.cycle_once();
        engine.cycle_once();
        assert!(shared.master_state().al_states.is_operational());
        assert_eq!(shared.driver().domain_data()[0], 0x5A);
        assert_eq!(shared.table().unwrap().get(0).unwrap().value(), 0x5A);
    }

    #[test]
    fn slow_path_is_throttled() {
        // 1 s health interval at 1 ms period: one refresh per 1000 cycles.
        let (mut engine, shared, _) = engine(1000);
        engine.cycle_once();
        engine.cycle_once();
        engine.cycle_once();
        // The simulation is OP by now, the snapshot still holds the first refresh.
        assert_eq!(shared.master_state().al_states, AlState::SAFEOP);
        assert_eq!(shared.cycle_count(), 3);
    }

    #[test]
    fn reports_carry_consecutive_cycle_numbers() {
        let (mut engine, shared, reports) = engine(1);
        for _ in 0..6 {
            engine.cycle_once();
        }
        assert_eq!(shared.cycle_count(), 6);
        let cycles: Vec<u64> = reports.lock().unwrap().iter().map(|r| r.cycle).collect();
        assert_eq!(cycles.first(), Some(&1));
        assert_eq!(cycles.last(), Some(&6));
        assert!(cycles.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn drain_releases_master() {
        let (mut engine, shared, _) = engine(1);
        for _ in 0..3 {
            engine.cycle_once();
        }
        assert!(shared.master_state().al_states.is_operational());
        engine.drain();
        assert_eq!(shared.cycle_state(), CycleState::Stopped);
        assert!(!shared.master_state().al_states.is_operational());
        assert_eq!(shared.driver().master_state(), MasterState::default());
    }

    #[test]
    fn run_stops_on_request() {
        let (engine, shared, _) = engine(1);
        let handle = std::thread::spawn(move || engine.run());
        while shared.cycle_count() < 5 {
            std::thread::sleep(Duration::from_millis(1));
        }
        shared.request_stop();
        let stats = handle.join().unwrap();
        assert!(stats.cycle_count >= 5);
        assert_eq!(shared.cycle_state(), CycleState::Stopped);
    }
}
