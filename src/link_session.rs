use crate::ack_scheduler::AckScheduler;
use crate::checksum::FrameChecksum;
use crate::collaborators::{AlarmSeverity, AlarmSink, SampleSink, StationValidator};
use crate::config::LinkConfig;
use crate::control_messages::{AckNackMessage, AlertMessage, ConnectionMessage};
use crate::data_payload::DataPayload;
use crate::frame::{Frame, FrameType};
use crate::frame_codec::{FrameCodec, FrameReadError};
use crate::gap_list::{ArrivalDisposition, GapList, ReconcileOutcome};
use crate::gap_snapshot::SnapshotStore;
use crate::safe_converter::SafeCast;
use crate::sample_codec::{decode_samples, SampleDecompressor};
use crate::send_pipeline::SendPipeline;
use crate::station_token::{FrameSetLabel, StationToken};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// how long a stopping task may take to drain before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    /// no connection; awaiting the broker's next reopen
    Idle,
    /// reopen in progress, connection response being sent
    Handshaking,
    /// reader and ack scheduler running
    Active,
    /// deliberate teardown in progress
    Draining,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum FrameOutcome {
    Continue,
    Terminate,
}

struct SessionCore {
    state: LinkState,
    series: Option<u32>,
    peer_creator: Option<StationToken>,
    peer_destination: Option<StationToken>,
    peer_auth_id: Option<u32>,
}

struct ActiveConnection {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    scheduler: JoinHandle<()>,
}

/// One station's link session: owns the (gap list, series identity, active connection) triple,
///  handles handshake-driven reconnection, runs the frame-read loop and drives the ack
///  scheduler. Sessions are fully independent of each other; a process hosts many.
///
/// All collaborators are injected: the connection broker calls `reopen`, decoded samples flow
///  to the `SampleSink`, anomalies to the `AlarmSink`.
pub struct LinkSession {
    /// handle to the Arc this session lives in, for handing the session to spawned tasks
    self_ref: Weak<LinkSession>,
    config: Arc<LinkConfig>,
    creator: StationToken,
    destination: StationToken,
    checksum: Arc<dyn FrameChecksum>,
    decompressor: Arc<dyn SampleDecompressor>,
    samples: Arc<dyn SampleSink>,
    stations: Arc<dyn StationValidator>,
    alarms: Arc<dyn AlarmSink>,
    snapshots: Option<Arc<SnapshotStore>>,
    gap_list: Arc<Mutex<GapList>>,
    /// lock order: `core` before `gap_list` when both are needed
    core: Mutex<SessionCore>,
    armed: Arc<AtomicBool>,
    active: Mutex<Option<ActiveConnection>>,
}

impl LinkSession {
    pub fn new(
        config: LinkConfig,
        checksum: Arc<dyn FrameChecksum>,
        decompressor: Arc<dyn SampleDecompressor>,
        samples: Arc<dyn SampleSink>,
        stations: Arc<dyn StationValidator>,
        alarms: Arc<dyn AlarmSink>,
    ) -> anyhow::Result<Arc<LinkSession>> {
        config.validate()?;
        let creator = config.creator_token()?;
        let destination = config.destination_token()?;
        let snapshots = config.snapshot_path.clone().map(|path| Arc::new(SnapshotStore::new(path)));

        let policy = config.gap_policy();
        let mut series = None;
        let mut gap_list = GapList::new(0, policy);
        if let Some(store) = &snapshots {
            if let Some(snapshot) = store.load()? {
                info!("station {}: restoring gap state from snapshot: series {}, [{}, {}], {} gaps",
                    config.station_name, snapshot.series, snapshot.lowest_seq, snapshot.highest_seq, snapshot.gaps.len());
                series = Some(snapshot.series);
                gap_list = GapList::from_snapshot(&snapshot, policy);
            }
        }

        Ok(Arc::new_cyclic(|self_ref| LinkSession {
            self_ref: self_ref.clone(),
            config: Arc::new(config),
            creator,
            destination,
            checksum,
            decompressor,
            samples,
            stations,
            alarms,
            snapshots,
            gap_list: Arc::new(Mutex::new(gap_list)),
            core: Mutex::new(SessionCore {
                state: LinkState::Idle,
                series,
                peer_creator: None,
                peer_destination: None,
                peer_auth_id: None,
            }),
            armed: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
        }))
    }

    pub fn station_name(&self) -> &str {
        &self.config.station_name
    }

    pub async fn state(&self) -> LinkState {
        self.core.lock().await.state
    }

    pub async fn current_series(&self) -> Option<u32> {
        self.core.lock().await.series
    }

    pub async fn peer_identity(&self) -> Option<(StationToken, StationToken)> {
        let core = self.core.lock().await;
        core.peer_creator.zip(core.peer_destination)
    }

    /// auth key id the peer announced in its connection request trailer
    pub async fn peer_auth_id(&self) -> Option<u32> {
        self.core.lock().await.peer_auth_id
    }

    fn frame_set(&self) -> FrameSetLabel {
        FrameSetLabel::new(self.creator, self.destination)
    }

    /// Install a freshly accepted connection, handed over by the external connection broker
    ///  together with the already-decoded connection request frame. A previously active
    ///  connection is fully stopped first: a session has at most one live connection.
    pub async fn reopen<I>(&self, conn_req: Frame, io: I) -> anyhow::Result<()>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Some(session) = self.self_ref.upgrade() else {
            anyhow::bail!("session is being dropped");
        };

        self.terminate_active("replaced by reopen").await;
        self.set_state(LinkState::Handshaking).await;

        if conn_req.header.frame_type != FrameType::ConnectionRequest {
            self.set_state(LinkState::Idle).await;
            anyhow::bail!("reopen requires a connection request frame, got {:?}", conn_req.header.frame_type);
        }
        if !conn_req.checksum_valid {
            self.alarms.raise(AlarmSeverity::Warning,
                format!("station {}: connection request failed checksum verification", self.config.station_name)).await;
            self.set_state(LinkState::Idle).await;
            anyhow::bail!("connection request failed checksum verification");
        }

        {
            let mut core = self.core.lock().await;
            core.peer_creator = Some(conn_req.header.creator);
            core.peer_destination = Some(conn_req.header.destination);
            core.peer_auth_id = Some(conn_req.trailer.auth_id);
        }

        match ConnectionMessage::deser(&mut conn_req.payload.as_ref()) {
            Ok(request) => {
                let requested = request.station.trimmed();
                if requested != self.config.station_name || !self.stations.is_known_station(&requested) {
                    // mismatch is logged, not fatal: the session proceeds under its own identity
                    warn!("connection request names station {:?}, session is configured for {:?}", requested, self.config.station_name);
                    self.alarms.raise(AlarmSeverity::Warning,
                        format!("station identity mismatch: requested {:?}, configured {:?}", requested, self.config.station_name)).await;
                }
            }
            Err(e) => {
                warn!("unparseable connection request payload ({:#}) - proceeding with the configured identity", e);
            }
        }

        let (read_half, write_half) = tokio::io::split(io);
        let pipeline = SendPipeline::new(Arc::new(Mutex::new(write_half)));
        let codec = FrameCodec::new(self.checksum.clone(), self.config.max_frame_len, self.config.max_auth_len);

        let series = self.core.lock().await.series.unwrap_or(0);
        let mut payload = BytesMut::new();
        ConnectionMessage::for_station(self.creator).ser(&mut payload);
        let response = Frame::new(FrameType::ConnectionResponse, self.creator, self.destination, 0, series, payload.freeze());
        if let Err(e) = pipeline.send_frame(&codec.encode(&response)).await {
            self.set_state(LinkState::Idle).await;
            return Err(e.context("sending the connection response"));
        }

        // the peer demonstrably exists, so acknowledgments may flow immediately
        self.armed.store(true, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let scheduler = AckScheduler::new(
            self.config.clone(),
            self.checksum.clone(),
            self.gap_list.clone(),
            pipeline.clone(),
            self.frame_set(),
            self.armed.clone(),
            self.snapshots.clone(),
            cancel.clone(),
        );
        let scheduler_handle = tokio::spawn(scheduler.run());

        let reader_cancel = cancel.clone();
        let correlation_id = Uuid::new_v4();
        let reader_span = span!(Level::DEBUG, "link_reader", station = %self.config.station_name, %correlation_id);
        let reader_handle = tokio::spawn(
            async move {
                session.reader_loop(codec, read_half, pipeline, reader_cancel).await;
            }
            .instrument(reader_span),
        );

        *self.active.lock().await = Some(ActiveConnection {
            cancel,
            reader: reader_handle,
            scheduler: scheduler_handle,
        });
        self.set_state(LinkState::Active).await;
        info!("station {}: connection reopened", self.config.station_name);
        Ok(())
    }

    /// Deliberate teardown: terminal acknowledgment and alert go out, then the session returns
    ///  to Idle awaiting the broker's next reopen.
    pub async fn close(&self) {
        self.set_state(LinkState::Draining).await;
        self.terminate_active("session close").await;
        self.set_state(LinkState::Idle).await;
        info!("station {}: session closed", self.config.station_name);
    }

    async fn set_state(&self, state: LinkState) {
        self.core.lock().await.state = state;
    }

    async fn terminate_active(&self, why: &str) {
        let connection = self.active.lock().await.take();
        let Some(connection) = connection else {
            return;
        };
        debug!("station {}: stopping the active connection ({})", self.config.station_name, why);
        connection.cancel.cancel();

        // The scheduler drains first: its terminal ACKNACK and ALERT must go out while the
        //  socket is still alive, and no acknowledgment may be built once teardown proceeds.
        let mut scheduler = connection.scheduler;
        if timeout(SHUTDOWN_GRACE, &mut scheduler).await.is_err() {
            warn!("ack scheduler did not drain in time - aborting it");
            scheduler.abort();
        }
        let mut reader = connection.reader;
        if timeout(SHUTDOWN_GRACE, &mut reader).await.is_err() {
            warn!("reader did not drain in time - aborting it");
            reader.abort();
        }
    }

    async fn reader_loop<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        mut codec: FrameCodec,
        mut read_half: R,
        pipeline: SendPipeline,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = select! {
                _ = cancel.cancelled() => {
                    debug!("reader stopping on cancellation");
                    break;
                }
                result = timeout(self.config.liveness_timeout, codec.read_frame(&mut read_half)) => match result {
                    Err(_) => {
                        warn!("no inbound data for {:?} - force-closing the connection", self.config.liveness_timeout);
                        self.alarms.raise(AlarmSeverity::Warning,
                            format!("station {}: liveness timeout, awaiting reconnect", self.config.station_name)).await;
                        break;
                    }
                    Ok(Err(FrameReadError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        info!("peer closed the connection");
                        break;
                    }
                    Ok(Err(FrameReadError::Io(e))) => {
                        warn!("transport error ({}) - closing the connection", e);
                        break;
                    }
                    Ok(Err(e @ FrameReadError::MalformedHeader(_))) => {
                        warn!("{} - stream framing can no longer be trusted, closing the connection", e);
                        self.alarms.raise(AlarmSeverity::Fault,
                            format!("station {}: {}", self.config.station_name, e)).await;
                        break;
                    }
                    Ok(Ok(frame)) => frame,
                }
            };

            if self.handle_frame(frame, &codec, &pipeline).await == FrameOutcome::Terminate {
                break;
            }
        }

        // stop the scheduler as well; it sends the terminal frames on its way out
        cancel.cancel();
        let mut core = self.core.lock().await;
        if core.state != LinkState::Draining {
            core.state = LinkState::Idle;
        }
    }

    async fn handle_frame(&self, frame: Frame, codec: &FrameCodec, pipeline: &SendPipeline) -> FrameOutcome {
        trace!("received {:?} frame #{} (series {})", frame.header.frame_type, frame.header.sequence, frame.header.series);

        if !frame.checksum_valid {
            warn!("discarding {:?} frame #{} with invalid checksum", frame.header.frame_type, frame.header.sequence);
            self.alarms.raise(AlarmSeverity::Warning,
                format!("station {}: frame failed checksum verification", self.config.station_name)).await;
            return FrameOutcome::Continue;
        }

        self.armed.store(true, Ordering::Relaxed);
        self.track_series(frame.header.series).await;

        match frame.header.frame_type {
            FrameType::Data | FrameType::Cd1Encapsulation => self.handle_data_frame(&frame).await,
            FrameType::AckNack => self.handle_acknack(&frame).await,
            FrameType::Alert => {
                let reason = AlertMessage::deser(&mut frame.payload.as_ref())
                    .map(|msg| msg.message)
                    .unwrap_or_else(|_| "<unparseable>".to_string());
                info!("peer alerted ({:?}) - terminating the session", reason);
                return FrameOutcome::Terminate;
            }
            FrameType::OptionRequest => {
                debug!("answering option request with an empty option set");
                let response = Frame::new(FrameType::OptionResponse, self.creator, self.destination, 0, frame.header.series, Bytes::new());
                if let Err(e) = pipeline.send_frame(&codec.encode(&response)).await {
                    debug!("failed to send option response: {:#}", e);
                }
            }
            FrameType::CommandRequest => debug!("unhandled command request frame #{} - ignoring", frame.header.sequence),
            other => debug!("unexpected {:?} frame - ignoring", other),
        }
        FrameOutcome::Continue
    }

    /// A change in the series of any inbound frame means the peer's sequence space has reset:
    ///  the gap list is discarded and rebuilt from scratch for the new series.
    async fn track_series(&self, series: u32) {
        let reset_from = {
            let mut core = self.core.lock().await;
            match core.series {
                None => {
                    core.series = Some(series);
                    let mut gap_list = self.gap_list.lock().await;
                    if gap_list.series() != series {
                        gap_list.rebuild_for_series(series);
                    }
                    None
                }
                Some(previous) if previous != series => {
                    core.series = Some(series);
                    self.gap_list.lock().await.rebuild_for_series(series);
                    Some(previous)
                }
                _ => None,
            }
        };

        if let Some(previous) = reset_from {
            warn!("series changed from {} to {} - discarded gap state of the old series", previous, series);
            self.alarms.raise(AlarmSeverity::Fault,
                format!("station {}: series changed from {} to {}", self.config.station_name, previous, series)).await;
        }
    }

    async fn handle_data_frame(&self, frame: &Frame) {
        let seq = frame.header.sequence;
        let disposition = self.gap_list.lock().await.record_arrival(seq);

        match disposition {
            ArrivalDisposition::StaleBelowWindow => {
                debug!("frame #{} is a stale resend far below the receive window - discarding", seq);
                return;
            }
            ArrivalDisposition::AlreadyPresent => {
                trace!("frame #{} already received - discarding benign resend", seq);
                return;
            }
            ArrivalDisposition::NewGap { reset_suspected: true } => {
                warn!("frame #{} jumped far ahead of the previous high water mark", seq);
                self.alarms.raise(AlarmSeverity::Fault,
                    format!("station {}: sequence jumped to #{}, possible series reset or long telemetry delay", self.config.station_name, seq)).await;
            }
            disposition => trace!("frame #{} recorded: {:?}", seq, disposition),
        }

        if frame.header.frame_type == FrameType::Cd1Encapsulation {
            debug!("encapsulated frame #{} recorded; payload is passed over without decoding", seq);
            return;
        }

        let payload = match DataPayload::deser(&mut frame.payload.as_ref()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("undecodable data payload in frame #{}: {:#} - dropping the payload", seq, e);
                self.alarms.raise(AlarmSeverity::Warning,
                    format!("station {}: undecodable data payload in frame #{}", self.config.station_name, seq)).await;
                return;
            }
        };

        for subframe in &payload.subframes {
            if !subframe.channel_recognized {
                // data quality signal; the samples still flow upstream
                self.alarms.raise(AlarmSeverity::Warning,
                    format!("station {}: unrecognized channel {:?}", self.config.station_name, subframe.station_code)).await;
            }
            let Some(start_time) = subframe.timestamp else {
                warn!("subframe for {:?} has no usable timestamp - skipping its samples", subframe.station_code);
                continue;
            };

            let expected: usize = subframe.sample_count.safe_cast();
            match decode_samples(subframe.transform, &subframe.sample_format, &subframe.sample_data, expected, self.decompressor.as_ref()) {
                Ok(samples) => {
                    let sample_rate = if subframe.duration_ms > 0 {
                        samples.len() as f64 * 1000.0 / subframe.duration_ms as f64
                    } else {
                        0.0
                    };
                    self.samples.accept(&subframe.station_code, start_time, sample_rate, samples).await;
                }
                Err(e) => {
                    warn!("cannot decode samples for {:?}: {} - skipping the subframe", subframe.station_code, e);
                }
            }
        }
    }

    async fn handle_acknack(&self, frame: &Frame) {
        let msg = match AckNackMessage::deser(&mut frame.payload.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable ACKNACK payload: {:#} - discarding", e);
                return;
            }
        };

        {
            // peers have been observed to report a different frame set label on their very
            //  first spontaneous ack: keep the recorded peer identity in sync
            let mut core = self.core.lock().await;
            core.peer_creator = Some(frame.header.creator);
            core.peer_destination = Some(frame.header.destination);
        }

        let outcome = self.gap_list.lock().await.reconcile(msg.lowest_seq, msg.highest_seq, &msg.gaps);
        match outcome {
            ReconcileOutcome::FrameSetChanged => {
                warn!("peer-reported envelope [{}, {}] is irreconcilable with local state - frame set reset", msg.lowest_seq, msg.highest_seq);
                self.alarms.raise(AlarmSeverity::Fault,
                    format!("station {}: frame set changed, peer envelope [{}, {}]", self.config.station_name, msg.lowest_seq, msg.highest_seq)).await;
            }
            ReconcileOutcome::AdoptedPeerEnvelope => {
                info!("adopted peer envelope [{}, {}] for the uninitialized gap state", msg.lowest_seq, msg.highest_seq);
            }
            ReconcileOutcome::Converged { peer_jumped_ahead: true } => {
                warn!("peer's high water mark {} is far ahead of local state", msg.highest_seq);
                self.alarms.raise(AlarmSeverity::Warning,
                    format!("station {}: peer high water mark jumped to {}", self.config.station_name, msg.highest_seq)).await;
            }
            ReconcileOutcome::Converged { .. } => {
                trace!("reconciled against peer envelope [{}, {}]", msg.lowest_seq, msg.highest_seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc64FrameChecksum;
    use crate::data_payload::Subframe;
    use crate::gap_list::Gap;
    use crate::sample_codec::NoDecompression;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct RecordingSink {
        accepted: std::sync::Mutex<Vec<(String, NaiveDateTime, f64, Vec<i32>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink { accepted: std::sync::Mutex::new(Vec::new()) })
        }

        fn segments(&self) -> Vec<(String, NaiveDateTime, f64, Vec<i32>)> {
            self.accepted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SampleSink for RecordingSink {
        async fn accept(&self, station_code: &str, start_time: NaiveDateTime, sample_rate: f64, samples: Vec<i32>) {
            self.accepted.lock().unwrap().push((station_code.to_string(), start_time, sample_rate, samples));
        }
    }

    struct RecordingAlarms {
        raised: std::sync::Mutex<Vec<(AlarmSeverity, String)>>,
    }

    impl RecordingAlarms {
        fn new() -> Arc<RecordingAlarms> {
            Arc::new(RecordingAlarms { raised: std::sync::Mutex::new(Vec::new()) })
        }

        fn raised(&self) -> Vec<(AlarmSeverity, String)> {
            self.raised.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlarmSink for RecordingAlarms {
        async fn raise(&self, severity: AlarmSeverity, message: String) {
            self.raised.lock().unwrap().push((severity, message));
        }
    }

    struct AnyStation;

    impl StationValidator for AnyStation {
        fn is_known_station(&self, _station_name: &str) -> bool {
            true
        }
    }

    struct TestHarness {
        session: Arc<LinkSession>,
        sink: Arc<RecordingSink>,
        alarms: Arc<RecordingAlarms>,
    }

    fn test_config() -> LinkConfig {
        let mut config = LinkConfig::default_for_station("STA01");
        config.ack_interval = Duration::from_secs(3600);
        config.checkpoint_interval = Duration::from_secs(3600);
        config.liveness_timeout = Duration::from_secs(3600);
        config
    }

    fn harness(config: LinkConfig) -> TestHarness {
        let sink = RecordingSink::new();
        let alarms = RecordingAlarms::new();
        let session = LinkSession::new(
            config,
            Arc::new(Crc64FrameChecksum),
            Arc::new(NoDecompression),
            sink.clone(),
            Arc::new(AnyStation),
            alarms.clone(),
        )
        .unwrap();
        TestHarness { session, sink, alarms }
    }

    /// the far end of the link: encodes what a sending station would put on the wire
    struct TestPeer {
        io: DuplexStream,
        codec: FrameCodec,
        station: StationToken,
        destination: StationToken,
    }

    impl TestPeer {
        fn new(io: DuplexStream) -> TestPeer {
            TestPeer {
                io,
                codec: FrameCodec::new(Arc::new(Crc64FrameChecksum), 16 * 1024 * 1024, 4096),
                station: StationToken::new("STA01").unwrap(),
                destination: StationToken::new("IDC").unwrap(),
            }
        }

        fn connection_request(&self) -> Frame {
            let mut payload = BytesMut::new();
            ConnectionMessage::for_station(self.station).ser(&mut payload);
            Frame::new(FrameType::ConnectionRequest, self.station, self.destination, 0, 0, payload.freeze())
        }

        async fn send_frame(&mut self, frame: &Frame) {
            let buf = self.codec.encode(frame);
            self.io.write_all(&buf).await.unwrap();
        }

        async fn send_data_frame(&mut self, sequence: u64, series: u32) {
            let frame = Frame::new(FrameType::Data, self.station, self.destination, sequence, series, data_payload_bytes());
            self.send_frame(&frame).await;
        }

        async fn read_frame(&mut self) -> Frame {
            timeout(Duration::from_secs(5), self.codec.read_frame(&mut self.io))
                .await
                .expect("expected a frame within the test timeout")
                .unwrap()
        }

        async fn read_frame_of_type(&mut self, frame_type: FrameType) -> Frame {
            loop {
                let frame = self.read_frame().await;
                if frame.header.frame_type == frame_type {
                    return frame;
                }
            }
        }
    }

    fn start_time() -> NaiveDateTime {
        NaiveDate::from_yo_opt(2025, 217).unwrap().and_hms_milli_opt(13, 0, 0, 0).unwrap()
    }

    fn data_payload_bytes() -> Bytes {
        let subframe = Subframe {
            station_code: "STA01BHZ".to_string(),
            transform: 0,
            sensor: 0,
            sample_format: *b"s2",
            calib_factor: 1.0,
            calib_period: 1.0,
            timestamp: Some(start_time()),
            duration_ms: 1000,
            sample_count: 4,
            status: Bytes::from_static(&[0x01]),
            sample_data: Bytes::from_static(&[0, 1, 0, 2, 0, 3, 0, 4]),
            subframe_count: 1,
            auth_key_id: 0,
            auth_body: Bytes::new(),
            channel_recognized: true,
        };
        let payload = DataPayload::new(1000, Some(start_time()), vec![subframe]);
        let mut buf = BytesMut::new();
        payload.ser(&mut buf);
        buf.freeze()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within the test timeout");
    }

    async fn open_session(harness: &TestHarness) -> TestPeer {
        let (peer_io, session_io) = tokio::io::duplex(256 * 1024);
        let mut peer = TestPeer::new(peer_io);
        harness.session.reopen(peer.connection_request(), session_io).await.unwrap();

        let response = peer.read_frame().await;
        assert_eq!(response.header.frame_type, FrameType::ConnectionResponse);
        peer
    }

    #[tokio::test]
    async fn test_samples_flow_to_the_sink() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;
        assert_eq!(h.session.state().await, LinkState::Active);

        peer.send_data_frame(1, 1).await;
        peer.send_data_frame(2, 1).await;

        wait_until(|| h.sink.segments().len() == 2).await;
        let (station_code, time, rate, samples) = h.sink.segments().remove(0);
        assert_eq!(station_code, "STA01BHZ");
        assert_eq!(time, start_time());
        assert_eq!(rate, 4.0);
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_reports_gaps_and_alerts_the_peer() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        peer.send_data_frame(1, 1).await;
        peer.send_data_frame(3, 1).await;
        wait_until(|| h.sink.segments().len() == 2).await;

        h.session.close().await;

        let ack = peer.read_frame_of_type(FrameType::AckNack).await;
        let msg = AckNackMessage::deser(&mut ack.payload.as_ref()).unwrap();
        assert_eq!(msg.lowest_seq, 1);
        assert_eq!(msg.highest_seq, 3);
        assert_eq!(msg.gaps, vec![Gap { low: 2, high: 3 }]);

        let alert = peer.read_frame_of_type(FrameType::Alert).await;
        assert_eq!(AlertMessage::deser(&mut alert.payload.as_ref()).unwrap().message, "terminated");

        assert_eq!(h.session.state().await, LinkState::Idle);
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_not_recorded() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        peer.send_data_frame(1, 1).await;

        // frame #2 arrives with a flipped payload byte; it must not enter the gap accounting
        let frame = Frame::new(FrameType::Data, peer.station, peer.destination, 2, 1, data_payload_bytes());
        let mut buf = peer.codec.encode(&frame);
        buf[40] ^= 0xff;
        peer.io.write_all(&buf).await.unwrap();

        peer.send_data_frame(3, 1).await;
        wait_until(|| h.sink.segments().len() == 2).await;

        h.session.close().await;
        let ack = peer.read_frame_of_type(FrameType::AckNack).await;
        let msg = AckNackMessage::deser(&mut ack.payload.as_ref()).unwrap();
        assert_eq!(msg.gaps, vec![Gap { low: 2, high: 3 }]);

        assert!(h.alarms.raised().iter().any(|(severity, message)|
            *severity == AlarmSeverity::Warning && message.contains("checksum")));
    }

    #[tokio::test]
    async fn test_series_change_resets_gap_state() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        peer.send_data_frame(1, 1).await;
        peer.send_data_frame(5, 1).await;
        wait_until(|| h.sink.segments().len() == 2).await;

        // the peer restarts its numbering: a gap from series 1 must never reappear
        peer.send_data_frame(10, 2).await;
        wait_until(|| h.sink.segments().len() == 3).await;

        h.session.close().await;
        let ack = peer.read_frame_of_type(FrameType::AckNack).await;
        assert_eq!(ack.header.series, 2);
        let msg = AckNackMessage::deser(&mut ack.payload.as_ref()).unwrap();
        assert_eq!(msg.lowest_seq, 10);
        assert_eq!(msg.highest_seq, 10);
        assert!(msg.gaps.is_empty());

        assert_eq!(h.session.current_series().await, Some(2));
        assert!(h.alarms.raised().iter().any(|(severity, message)|
            *severity == AlarmSeverity::Fault && message.contains("series changed")));
    }

    #[tokio::test]
    async fn test_peer_alert_terminates_the_session() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        peer.send_data_frame(1, 1).await;
        wait_until(|| h.sink.segments().len() == 1).await;

        let mut payload = BytesMut::new();
        AlertMessage::terminated().ser(&mut payload);
        let alert = Frame::new(FrameType::Alert, peer.station, peer.destination, 0, 1, payload.freeze());
        peer.send_frame(&alert).await;

        // the reader processes the alert and winds the session down asynchronously
        for _ in 0..250 {
            if h.session.state().await == LinkState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.session.state().await, LinkState::Idle);

        // the peer still receives the terminal frames before the socket goes away
        let final_alert = peer.read_frame_of_type(FrameType::Alert).await;
        assert_eq!(AlertMessage::deser(&mut final_alert.payload.as_ref()).unwrap().message, "terminated");
    }

    #[tokio::test]
    async fn test_acknack_reconciliation_and_peer_identity_update() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        peer.send_data_frame(1, 1).await;
        peer.send_data_frame(2, 1).await;
        wait_until(|| h.sink.segments().len() == 2).await;

        // the peer's first spontaneous ack reports a different frame set label and an envelope
        //  far ahead of ours
        let reporting_creator = StationToken::new("STA01B").unwrap();
        let msg = AckNackMessage {
            frame_set: FrameSetLabel::new(reporting_creator, peer.destination),
            lowest_seq: 5000,
            highest_seq: 5100,
            gaps: vec![],
        };
        let mut payload = BytesMut::new();
        msg.ser(&mut payload);
        let acknack = Frame::new(FrameType::AckNack, reporting_creator, peer.destination, 0, 1, payload.freeze());
        peer.send_frame(&acknack).await;

        // the recorded peer identity follows the label reported in the ack
        for _ in 0..250 {
            if h.session.peer_identity().await.map(|(creator, _)| creator) == Some(reporting_creator) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.session.peer_identity().await.map(|(creator, _)| creator), Some(reporting_creator));

        h.session.close().await;
        let ack = peer.read_frame_of_type(FrameType::AckNack).await;
        let reported = AckNackMessage::deser(&mut ack.payload.as_ref()).unwrap();
        assert!(reported.lowest_seq >= 5000);
        assert_eq!(reported.highest_seq, 5100);

        assert!(h.alarms.raised().iter().any(|(severity, message)|
            *severity == AlarmSeverity::Fault && message.contains("frame set changed")));
    }

    #[tokio::test]
    async fn test_reopen_replaces_the_previous_connection() {
        let h = harness(test_config());
        let mut first_peer = open_session(&h).await;
        first_peer.send_data_frame(1, 1).await;
        wait_until(|| h.sink.segments().len() == 1).await;

        // a second accepted connection for the same station displaces the first
        let mut second_peer = open_session(&h).await;
        assert_eq!(h.session.state().await, LinkState::Active);

        // the displaced peer is told definitively that retransmission should stop
        let alert = first_peer.read_frame_of_type(FrameType::Alert).await;
        assert_eq!(AlertMessage::deser(&mut alert.payload.as_ref()).unwrap().message, "terminated");

        second_peer.send_data_frame(2, 1).await;
        wait_until(|| h.sink.segments().len() == 2).await;
    }

    #[tokio::test]
    async fn test_option_request_gets_a_minimal_response() {
        let h = harness(test_config());
        let mut peer = open_session(&h).await;

        let request = Frame::new(FrameType::OptionRequest, peer.station, peer.destination, 0, 1, Bytes::new());
        peer.send_frame(&request).await;

        let response = peer.read_frame_of_type(FrameType::OptionResponse).await;
        assert!(response.payload.is_empty());
        assert_eq!(h.session.state().await, LinkState::Active);
    }
}
