use crate::checksum::FrameChecksum;
use crate::config::LinkConfig;
use crate::control_messages::AlertMessage;
use crate::frame::{Frame, FrameType};
use crate::frame_codec::FrameCodec;
use crate::gap_list::GapList;
use crate::gap_snapshot::SnapshotStore;
use crate::send_pipeline::SendPipeline;
use crate::station_token::FrameSetLabel;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Periodically reports the session's gap state to the peer so it can retransmit, independent
///  of whether data is arriving.
///
/// Acknowledgments are gated by the `armed` flag, set by the session on reopen or on the first
///  successfully received frame: acking an envelope the peer has never confirmed would invite
///  retransmission of garbage. On cancellation the scheduler sends one final ACKNACK followed
///  by an ALERT so the peer learns definitively that retransmission should stop.
pub struct AckScheduler {
    config: Arc<LinkConfig>,
    gap_list: Arc<Mutex<GapList>>,
    send: SendPipeline,
    codec: FrameCodec,
    frame_set: FrameSetLabel,
    armed: Arc<AtomicBool>,
    snapshots: Option<Arc<SnapshotStore>>,
    cancel: CancellationToken,
}

impl AckScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<LinkConfig>,
        checksum: Arc<dyn FrameChecksum>,
        gap_list: Arc<Mutex<GapList>>,
        send: SendPipeline,
        frame_set: FrameSetLabel,
        armed: Arc<AtomicBool>,
        snapshots: Option<Arc<SnapshotStore>>,
        cancel: CancellationToken,
    ) -> AckScheduler {
        let codec = FrameCodec::new(checksum, config.max_frame_len, config.max_auth_len);
        AckScheduler {
            config,
            gap_list,
            send,
            codec,
            frame_set,
            armed,
            snapshots,
            cancel,
        }
    }

    /// Runs until cancelled. The first acknowledgment goes out immediately (first contact /
    ///  reopen), subsequent ones on the configured cadence.
    pub async fn run(self) {
        let mut ack_interval = interval(self.config.ack_interval);
        let mut checkpoint_interval = interval(self.config.checkpoint_interval);

        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ack_interval.tick() => self.send_ack().await,
                _ = checkpoint_interval.tick() => self.write_checkpoint().await,
            }
        }

        debug!("ack scheduler stopping - sending terminal acknowledgment and alert");
        self.send_ack().await;
        self.send_alert().await;
        self.write_checkpoint().await;
    }

    async fn send_ack(&self) {
        if !self.armed.load(Ordering::Relaxed) {
            trace!("acknowledgments not armed yet");
            return;
        }
        let (series, msg) = {
            let mut gap_list = self.gap_list.lock().await;
            if !gap_list.is_initialized() {
                trace!("gap state uninitialized - nothing to acknowledge");
                return;
            }
            (gap_list.series(), gap_list.to_ack_message(self.frame_set))
        };
        trace!("sending ACKNACK for series {}: [{}, {}], {} gaps", series, msg.lowest_seq, msg.highest_seq, msg.gaps.len());

        let mut payload = BytesMut::new();
        msg.ser(&mut payload);
        let frame = Frame::new(
            FrameType::AckNack,
            self.frame_set.creator,
            self.frame_set.destination,
            0,
            series,
            payload.freeze(),
        );

        if let Err(e) = self.send.send_frame(&self.codec.encode(&frame)).await {
            debug!("failed to send acknowledgment: {:#}", e);
        }
    }

    async fn send_alert(&self) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }
        let series = self.gap_list.lock().await.series();

        let mut payload = BytesMut::new();
        AlertMessage::terminated().ser(&mut payload);
        let frame = Frame::new(
            FrameType::Alert,
            self.frame_set.creator,
            self.frame_set.destination,
            0,
            series,
            payload.freeze(),
        );

        if let Err(e) = self.send.send_frame(&self.codec.encode(&frame)).await {
            debug!("failed to send terminal alert: {:#}", e);
        }
    }

    async fn write_checkpoint(&self) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = {
            let gap_list = self.gap_list.lock().await;
            if !gap_list.is_initialized() {
                return;
            }
            gap_list.snapshot()
        };
        if let Err(e) = store.save(&snapshot) {
            warn!("failed to checkpoint gap snapshot: {:#}", e);
        }
    }
}
