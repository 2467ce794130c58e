use crate::background::BackgroundModel;
use crate::config::{BayConfig, CaptureConfig, Config, ReconnectConfig, ValidationError};
use crate::detector::OccupancyDetector;
use crate::frame::Frame;
use crate::registry::StatusRegistry;
use crate::source::{FrameSource, SourceConnector, SourceError};
use crate::status::StatusMachine;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub enum BayCommand {
    ResetBackground,
    SetOutOfService(bool),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Bay {0} monitor is no longer running")]
    MonitorStopped(u32),
}

/// Operator-side handle to one running monitor: the two out-of-band
/// actions the admin surface needs.
#[derive(Clone)]
pub struct BayHandle {
    bay_id: u32,
    commands: mpsc::Sender<BayCommand>,
}

impl BayHandle {
    pub fn bay_id(&self) -> u32 {
        self.bay_id
    }

    pub async fn reset_background(&self) -> Result<(), CommandError> {
        self.commands
            .send(BayCommand::ResetBackground)
            .await
            .map_err(|_| CommandError::MonitorStopped(self.bay_id))
    }

    pub async fn set_out_of_service(&self, out_of_service: bool) -> Result<(), CommandError> {
        self.commands
            .send(BayCommand::SetOutOfService(out_of_service))
            .await
            .map_err(|_| CommandError::MonitorStopped(self.bay_id))
    }
}

/// Independent control loop for one bay: frame acquisition with
/// reconnection, background learning, occupancy detection, the debounced
/// status machine, and publication to the shared registry. A slow or
/// dead camera only ever stalls its own monitor.
pub struct BayMonitor<C: SourceConnector> {
    bay_id: u32,
    address: String,
    connector: Arc<C>,
    detector: OccupancyDetector,
    model: BackgroundModel,
    machine: StatusMachine,
    registry: Arc<StatusRegistry>,
    capture: CaptureConfig,
    reconnect: ReconnectConfig,
    probe_after: u32,
    commands: mpsc::Receiver<BayCommand>,
    consecutive_failures: u32,
}

impl<C: SourceConnector> BayMonitor<C> {
    /// Validates the bay's effective tunables; a bay with undefined
    /// thresholds refuses to start rather than run with them.
    pub fn new(
        bay: &BayConfig,
        config: &Config,
        connector: Arc<C>,
        registry: Arc<StatusRegistry>,
    ) -> Result<(Self, BayHandle), ValidationError> {
        if bay.id == 0 {
            return Err(ValidationError::BayId);
        }
        let detection = bay.effective_detection(&config.detection);
        detection.validate()?;
        config.status.validate()?;

        let (tx, rx) = mpsc::channel(16);
        let monitor = Self {
            bay_id: bay.id,
            address: bay.address.clone(),
            connector,
            detector: OccupancyDetector::new(
                detection.roi_fraction,
                detection.diff_threshold,
                detection.occupancy_threshold,
            ),
            model: BackgroundModel::new(detection.learning_frames, detection.background_decay),
            machine: StatusMachine::new(config.status.debounce_k),
            registry,
            capture: config.capture.clone(),
            reconnect: config.reconnect.clone(),
            probe_after: detection.probe_after,
            commands: rx,
            consecutive_failures: 0,
        };
        let handle = BayHandle {
            bay_id: bay.id,
            commands: tx,
        };
        Ok((monitor, handle))
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!(bay_id = self.bay_id, address = %self.address, "Bay monitor starting");
        let mut retry_delay = self.reconnect.initial_delay();

        'reconnect: loop {
            if shutdown_requested(&mut shutdown_rx) {
                break;
            }

            let mut source = match self.connector.connect(&self.address).await {
                Ok(source) => source,
                Err(error) => {
                    self.note_stream_fault(&error);
                    if self.backoff(&mut retry_delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                if shutdown_requested(&mut shutdown_rx) {
                    break 'reconnect;
                }
                self.drain_commands();

                match source.next_frame(self.capture.frame_timeout()).await {
                    Ok(frame) => {
                        // Any successful read resets the backoff schedule.
                        retry_delay = self.reconnect.initial_delay();
                        if !self.machine.is_connected() {
                            tracing::info!(bay_id = self.bay_id, "Stream connected");
                            self.consecutive_failures = 0;
                            self.machine.connection_restored();
                        }
                        self.cycle(frame);
                    }
                    Err(error) if error.is_stream_fault() => {
                        self.note_stream_fault(&error);
                        if self.backoff(&mut retry_delay, &mut shutdown_rx).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                    Err(error) => {
                        // Malformed frame: transient, skip the cycle
                        // without touching debounce state.
                        tracing::warn!(bay_id = self.bay_id, %error, "Skipping cycle");
                    }
                }

                self.publish();
                tokio::select! {
                    _ = sleep(self.capture.poll_interval()) => {}
                    _ = shutdown_rx.recv() => break 'reconnect,
                }
            }
        }

        self.publish();
        tracing::info!(bay_id = self.bay_id, "Bay monitor stopped");
    }

    /// One detection cycle for a successfully acquired frame.
    fn cycle(&mut self, frame: Frame) {
        if !self.model.is_warm() {
            self.learn(frame);
            return;
        }

        let result = match self.detector.detect(&frame, &self.model) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(bay_id = self.bay_id, %error, "Skipping cycle on malformed frame");
                return;
            }
        };

        if let Some(status) = self.machine.sample(&result) {
            tracing::info!(
                bay_id = self.bay_id,
                status = status.as_str(),
                confidence = result.confidence,
                "Bay status changed"
            );
        }

        // Only unoccupied frames feed the reference, so a parked car is
        // never absorbed into the background.
        if !result.occupied {
            if let Err(error) = self.model.absorb(&frame) {
                tracing::warn!(bay_id = self.bay_id, %error, "Background update skipped");
            }
        }
    }

    fn learn(&mut self, frame: Frame) {
        // Once the partial reference is usable, probe each learning frame
        // and stretch the window past frames that look occupied.
        if self.model.samples() >= self.probe_after {
            match self.detector.detect(&frame, &self.model) {
                Ok(result) if result.occupied => {
                    tracing::debug!(
                        bay_id = self.bay_id,
                        confidence = result.confidence,
                        "Occupied frame during learning, extending window"
                    );
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(bay_id = self.bay_id, %error, "Skipping learning frame");
                    return;
                }
            }
        }
        if let Err(error) = self.model.learn(&frame) {
            tracing::warn!(bay_id = self.bay_id, %error, "Skipping learning frame");
            return;
        }
        if self.model.is_warm() {
            tracing::info!(
                bay_id = self.bay_id,
                samples = self.model.samples(),
                "Background model warm"
            );
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                BayCommand::ResetBackground => {
                    tracing::info!(bay_id = self.bay_id, "Background model reset by operator");
                    self.model.reset();
                }
                BayCommand::SetOutOfService(out_of_service) => {
                    tracing::info!(bay_id = self.bay_id, out_of_service, "Service override changed");
                    self.machine.set_out_of_service(out_of_service);
                    self.publish();
                }
            }
        }
    }

    fn note_stream_fault(&mut self, error: &SourceError) {
        self.consecutive_failures += 1;
        tracing::warn!(
            bay_id = self.bay_id,
            %error,
            consecutive_failures = self.consecutive_failures,
            "Stream fault"
        );
        self.machine.connection_lost();
        // Learning covers the first frames after a reconnection, so the
        // stale reference is dropped with the connection.
        self.model.reset();
        self.publish();
    }

    /// Jittered exponential backoff between reconnection attempts.
    /// Returns true when shutdown was requested during the wait.
    async fn backoff(
        &self,
        retry_delay: &mut Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let jitter = rand::random::<f32>() * 0.2 + 0.9;
        let wait = retry_delay.mul_f32(jitter);
        tracing::debug!(bay_id = self.bay_id, ?wait, "Reconnect backoff");
        *retry_delay = (*retry_delay * 2).min(self.reconnect.max_delay());
        tokio::select! {
            _ = sleep(wait) => false,
            _ = shutdown_rx.recv() => true,
        }
    }

    fn publish(&self) {
        self.registry
            .publish(self.machine.snapshot(self.bay_id, self.consecutive_failures));
    }
}

fn shutdown_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    use broadcast::error::TryRecvError;
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionConfig, LogLevel, StatusConfig};
    use crate::frame::FrameError;
    use crate::status::BayStatus;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tokio::time::Instant;

    const W: u32 = 40;
    const H: u32 = 30;

    fn empty_frame() -> Frame {
        Frame::new(W, H, Bytes::from(vec![90u8; (W * H) as usize]), SystemTime::now(), 0).unwrap()
    }

    /// Frame with the left half of the centered 40% ROI brightened, i.e.
    /// a changed-pixel ratio of 0.5.
    fn half_occupied_frame() -> Frame {
        let (w, h) = (W as usize, H as usize);
        let (mx, my) = (w * 3 / 10, h * 3 / 10);
        let (rw, rh) = (w - 2 * mx, h - 2 * my);
        let mut pixels = vec![90u8; w * h];
        for y in my..my + rh {
            for x in mx..mx + rw / 2 {
                pixels[y * w + x] = 210;
            }
        }
        Frame::new(W, H, Bytes::from(pixels), SystemTime::now(), 0).unwrap()
    }

    enum Step {
        Frame(Frame),
        Corrupt,
        Fault,
    }

    struct ScriptedConnector {
        connections: Mutex<VecDeque<Result<VecDeque<Step>, String>>>,
        connect_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn new(connections: Vec<Result<Vec<Step>, String>>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(
                    connections
                        .into_iter()
                        .map(|c| c.map(VecDeque::from))
                        .collect(),
                ),
                connect_times: Mutex::new(Vec::new()),
            })
        }

        fn connect_times(&self) -> Vec<Instant> {
            self.connect_times.lock().unwrap().clone()
        }
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
    }

    #[async_trait]
    impl SourceConnector for ScriptedConnector {
        type Source = ScriptedSource;

        async fn connect(&self, _address: &str) -> Result<Self::Source, SourceError> {
            self.connect_times.lock().unwrap().push(Instant::now());
            let next = self.connections.lock().unwrap().pop_front();
            match next {
                Some(Ok(steps)) => Ok(ScriptedSource { steps }),
                Some(Err(reason)) => Err(SourceError::StreamUnavailable(reason)),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, SourceError> {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => Ok(frame),
                Some(Step::Corrupt) => Err(SourceError::CorruptFrame(FrameError::EmptyFrame)),
                Some(Step::Fault) => Err(SourceError::StreamUnavailable("scripted".into())),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn test_config(learning_frames: u32, debounce_k: u32, bays: Vec<BayConfig>) -> Config {
        Config {
            log_level: LogLevel::Info,
            capture: CaptureConfig {
                poll_interval_ms: 100,
                frame_timeout_ms: 5000,
            },
            reconnect: ReconnectConfig {
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
            detection: DetectionConfig {
                learning_frames,
                probe_after: 5,
                ..DetectionConfig::default()
            },
            status: StatusConfig { debounce_k },
            bays,
        }
    }

    fn bay(id: u32) -> BayConfig {
        BayConfig {
            id,
            address: format!("scripted://bay-{id}"),
            detection: None,
        }
    }

    fn spawn_monitor(
        connector: Arc<ScriptedConnector>,
        config: &Config,
        bay_config: &BayConfig,
    ) -> (Arc<StatusRegistry>, BayHandle, broadcast::Sender<()>) {
        let registry = Arc::new(StatusRegistry::new([bay_config.id]));
        let (monitor, handle) =
            BayMonitor::new(bay_config, config, connector, registry.clone()).expect("valid bay");
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(monitor.run(shutdown_rx));
        (registry, handle, shutdown_tx)
    }

    #[test]
    fn invalid_tunables_refuse_to_start() {
        let connector = ScriptedConnector::new(vec![]);
        let mut config = test_config(100, 3, vec![bay(1)]);
        config.detection.roi_fraction = 0.0;
        let registry = Arc::new(StatusRegistry::new([1]));
        let result = BayMonitor::new(&bay(1), &config, connector, registry);
        assert!(matches!(result, Err(ValidationError::RoiFraction(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn learning_then_sustained_occupancy_flips_to_in_use() {
        // Spec-style scenario: 100 identical empty frames, then 5 frames
        // with half the ROI changed; threshold 0.4, K = 3.
        let mut steps: Vec<Step> = (0..100).map(|_| Step::Frame(empty_frame())).collect();
        steps.extend((0..5).map(|_| Step::Frame(half_occupied_frame())));
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(100, 3, vec![bay(3)]);
        let (registry, _handle, _shutdown) = spawn_monitor(connector, &config, &bay(3));

        tokio::time::sleep(Duration::from_secs(60)).await;

        let snapshot = registry.get(3).expect("bay 3 present");
        assert_eq!(snapshot.status, BayStatus::InUse);
        assert!(snapshot.is_connected);
        assert!(
            (snapshot.last_confidence - 0.5).abs() < 0.07,
            "confidence {}",
            snapshot.last_confidence
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_available_while_learning() {
        let steps: Vec<Step> = (0..10).map(|_| Step::Frame(empty_frame())).collect();
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(100, 3, vec![bay(1)]);
        let (registry, _handle, _shutdown) = spawn_monitor(connector, &config, &bay(1));

        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = registry.get(1).expect("bay 1 present");
        assert_eq!(snapshot.status, BayStatus::Available);
        assert!(snapshot.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_fault_forces_connection_error_and_backs_off() {
        let mut steps: Vec<Step> = (0..20).map(|_| Step::Frame(empty_frame())).collect();
        steps.push(Step::Fault);
        let connector = ScriptedConnector::new(vec![
            Ok(steps),
            Err("down".into()),
            Err("down".into()),
            Err("down".into()),
            Ok((0..10).map(|_| Step::Frame(empty_frame())).collect()),
        ]);
        let config = test_config(5, 3, vec![bay(1)]);
        let (registry, _handle, _shutdown) = spawn_monitor(connector.clone(), &config, &bay(1));

        // Past the fault but before the retries complete.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = registry.get(1).expect("bay 1 present");
        assert_eq!(snapshot.status, BayStatus::ConnectionError);
        assert!(!snapshot.is_connected);
        assert!(snapshot.consecutive_failures >= 1);

        // Through the backoff schedule and a fresh learning window.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let snapshot = registry.get(1).expect("bay 1 present");
        assert_eq!(snapshot.status, BayStatus::Available);
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.consecutive_failures, 0);

        // Backoff doubles between failed attempts (10% jitter allowed).
        // The first gap also spans the streaming portion of the first
        // connection, so only the later gaps are asserted: the 1s wait
        // after the fault is followed by 2s, 4s, 8s waits.
        let times = connector.connect_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<f32> = times.windows(2).map(|w| (w[1] - w[0]).as_secs_f32()).collect();
        for (gap, expected) in gaps[1..].iter().zip([2.0f32, 4.0, 8.0]) {
            assert!(
                (expected * 0.9..=expected * 1.1 + 0.2).contains(gap),
                "gap {gap} not near {expected}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_frame_skips_cycle_without_disconnecting() {
        let mut steps: Vec<Step> = (0..6).map(|_| Step::Frame(empty_frame())).collect();
        steps.push(Step::Corrupt);
        steps.extend((0..6).map(|_| Step::Frame(empty_frame())));
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(5, 3, vec![bay(1)]);
        let (registry, _handle, _shutdown) = spawn_monitor(connector.clone(), &config, &bay(1));

        tokio::time::sleep(Duration::from_secs(10)).await;

        let snapshot = registry.get(1).expect("bay 1 present");
        assert_eq!(snapshot.status, BayStatus::Available);
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.consecutive_failures, 0);
        // No reconnect happened.
        assert_eq!(connector.connect_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_service_override_pins_status_until_cleared() {
        let mut steps: Vec<Step> = (0..30).map(|_| Step::Frame(empty_frame())).collect();
        steps.extend((0..60).map(|_| Step::Frame(half_occupied_frame())));
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(5, 3, vec![bay(2)]);
        let (registry, handle, _shutdown) = spawn_monitor(connector, &config, &bay(2));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.get(2).unwrap().status, BayStatus::Available);

        handle.set_out_of_service(true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Occupied frames are flowing, but the override pins the status.
        assert_eq!(registry.get(2).unwrap().status, BayStatus::OutOfService);

        handle.set_out_of_service(false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // The shadow state kept accumulating underneath.
        assert_eq!(registry.get(2).unwrap().status, BayStatus::InUse);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_reset_restarts_learning_suppression() {
        let steps: Vec<Step> = (0..10)
            .map(|_| Step::Frame(empty_frame()))
            .chain((0..20).map(|_| Step::Frame(half_occupied_frame())))
            .collect();
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(30, 3, vec![bay(1)]);
        let (registry, handle, _shutdown) = spawn_monitor(connector, &config, &bay(1));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(registry.get(1).unwrap().status, BayStatus::Available);

        // Reset mid-stream: the occupied frames that follow extend the
        // fresh learning window instead of driving a transition.
        handle.reset_background().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.get(1).unwrap().status, BayStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_monitor_after_the_current_cycle() {
        let steps: Vec<Step> = (0..1000).map(|_| Step::Frame(empty_frame())).collect();
        let connector = ScriptedConnector::new(vec![Ok(steps)]);
        let config = test_config(5, 3, vec![bay(1)]);
        let registry = Arc::new(StatusRegistry::new([1]));
        let (monitor, handle) =
            BayMonitor::new(&bay(1), &config, connector, registry.clone()).expect("valid bay");
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(monitor.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown_tx.send(()).unwrap();
        task.await.expect("monitor task joins");

        // The command channel is closed once the monitor is gone.
        assert!(handle.reset_background().await.is_err());
    }
}
