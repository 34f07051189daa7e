// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! The per-controller poll loop.
//!
//! One thread owns the vrings, the slot snapshot and the in-flight table of a
//! controller. Management changes arrive as `ControllerEvent`s and are applied
//! at the start of an iteration, backend completions arrive over a channel and
//! are published by the same thread, so nothing on the I/O path takes a lock.

use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};

use crate::config::{ControllerConfig, PollerTunables};
use crate::controller::{
    ControllerEvent, ControllerStats, HotplugNotice, RemoveCallback, ScsiDevice, SlotIndex,
};
use crate::request::*;
use crate::transport::{ActiveRings, SCSI_CTRL_QUEUE_IDX, SCSI_EVENT_QUEUE_IDX};
use address_space::GuestMemory;
use scsi_backend::bus::{SCSI_SENSE_LUN_NOT_SUPPORTED, SCSI_SENSE_TARGET_FAILURE, TASK_ABORTED};
use scsi_backend::{ScsiCompleteCb, ScsiLun, ScsiTask, ScsiTaskResult, SubmitError};
use util::byte_code::ByteCode;
use util::cpumask::CpuMask;
use virtio::{
    iov_from_buf, iov_to_buf, virtio_has_feature, ElemIovec, Element, PoppedChain,
    VIRTIO_SCSI_F_HOTPLUG,
};

/// Events kept while the guest provides no event buffer.
const MAX_PENDING_EVENTS: usize = 64;

/// Queue index and head index of a request.
type CmdKey = (usize, u16);

pub(crate) struct PollerHandle {
    pub events: Sender<ControllerEvent>,
    pub notices: Receiver<HotplugNotice>,
    pub thread: JoinHandle<()>,
}

/// Start the poller thread of controller `config.id`.
pub(crate) fn spawn_poller(
    config: &ControllerConfig,
    stats: Arc<ControllerStats>,
) -> Result<PollerHandle> {
    let (events_tx, events_rx) = channel();
    let (notices_tx, notices_rx) = channel();
    let name = config.id.clone();
    let cpumask = config.cpumask;
    let tunables = config.tunables();
    let thread = thread::Builder::new()
        .name(format!("vscsi-{}", name))
        .spawn(move || {
            Poller::new(name, cpumask, tunables, events_rx, notices_tx, stats).run();
        })
        .with_context(|| format!("Failed to spawn poller of controller {}", config.id))?;

    Ok(PollerHandle {
        events: events_tx,
        notices: notices_rx,
        thread,
    })
}

struct CompletionMsg {
    key: CmdKey,
    generation: u64,
    result: ScsiTaskResult,
}

/// Completion callback of one submission.
struct CmdCompleteCb {
    key: CmdKey,
    generation: u64,
    done: AtomicBool,
    sender: Sender<CompletionMsg>,
    poller: Thread,
    stats: Arc<ControllerStats>,
    /// The data buffers of the task point into this memory.
    _mem: Arc<GuestMemory>,
}

impl ScsiCompleteCb for CmdCompleteCb {
    fn scsi_task_complete_cb(&self, result: ScsiTaskResult) {
        if self.done.swap(true, Ordering::AcqRel) {
            ControllerStats::inc(&self.stats.duplicate_completions);
            warn!(
                "Duplicate completion of scsi request {} on queue {}",
                self.key.1, self.key.0
            );
            return;
        }

        let msg = CompletionMsg {
            key: self.key,
            generation: self.generation,
            result,
        };
        if self.sender.send(msg).is_err() {
            debug!("Poller is gone, drop completion of {}", self.key.1);
            return;
        }
        self.poller.unpark();
    }
}

struct InflightCmd {
    slot: SlotIndex,
    lun_id: u16,
    /// Changes on every submission, stale callbacks carry an older value.
    generation: u64,
    retries: u32,
    /// Progress count at the last busy refusal.
    refused_at: Option<u64>,
    task: ScsiTask,
    lun: Arc<dyn ScsiLun>,
    resp_iovec: Vec<ElemIovec>,
    data_in_len: u64,
}

enum SlotState {
    Empty,
    Bound(Arc<ScsiDevice>),
    Draining {
        device: Arc<ScsiDevice>,
        cb: Option<RemoveCallback>,
    },
}

struct LunDrain {
    slot: SlotIndex,
    lun: u16,
    cb: Option<RemoveCallback>,
}

struct Poller {
    name: String,
    cpumask: CpuMask,
    tunables: PollerTunables,
    events: Receiver<ControllerEvent>,
    notices: Sender<HotplugNotice>,
    stats: Arc<ControllerStats>,
    slots: Vec<SlotState>,
    lun_drains: Vec<LunDrain>,
    rings: Option<ActiveRings>,
    broken: Vec<bool>,
    need_notify: Vec<bool>,
    /// Request queue served first in the next iteration.
    next_queue: usize,
    inflight: HashMap<CmdKey, InflightCmd>,
    /// Commands refused as busy, per queue, submitted again next iteration.
    backlog: Vec<VecDeque<CmdKey>>,
    completion_tx: Sender<CompletionMsg>,
    completion_rx: Receiver<CompletionMsg>,
    generation: u64,
    /// Advances on every completion sweep that found work, and on idle steps
    /// taken with nothing submitted to a backend. Refused commands are retried
    /// once per step.
    progress: u64,
    pending_events: VecDeque<VirtioScsiEvent>,
    events_missed: bool,
    stopping: bool,
    thread: Thread,
}

impl Poller {
    fn new(
        name: String,
        cpumask: CpuMask,
        tunables: PollerTunables,
        events: Receiver<ControllerEvent>,
        notices: Sender<HotplugNotice>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let (completion_tx, completion_rx) = channel();
        Poller {
            name,
            cpumask,
            tunables,
            events,
            notices,
            stats,
            slots: SlotIndex::all().map(|_| SlotState::Empty).collect(),
            lun_drains: Vec::new(),
            rings: None,
            broken: Vec::new(),
            need_notify: Vec::new(),
            next_queue: 0,
            inflight: HashMap::new(),
            backlog: Vec::new(),
            completion_tx,
            completion_rx,
            generation: 0,
            progress: 0,
            pending_events: VecDeque::new(),
            events_missed: false,
            stopping: false,
            thread: thread::current(),
        }
    }

    fn run(mut self) {
        if let Err(e) = self.cpumask.bind_current_thread(&self.name) {
            warn!(
                "Poller of controller {} runs unbound to {}: {:?}",
                self.name, self.cpumask, e
            );
        }
        info!("Poller of controller {} started", self.name);

        loop {
            if !self.handle_events() {
                break;
            }

            let mut busy = false;
            if self.rings.is_some() {
                busy |= self.process_ctrl_queue();
                busy |= self.process_request_queues();
                busy |= self.flush_events();
            }
            busy |= self.sweep_completions();
            self.finish_drains();
            self.finish_stop();
            self.notify_guest();

            if !busy {
                thread::park_timeout(Duration::from_micros(self.tunables.idle_park_us));
                if self.submitted() == 0 {
                    self.progress += 1;
                }
            }
        }

        if !self.inflight.is_empty() {
            warn!(
                "Poller of controller {} exits with {} requests in flight",
                self.name,
                self.inflight.len()
            );
        }
        info!("Poller of controller {} stopped", self.name);
    }

    /// Apply deferred events, false once the poller should exit.
    fn handle_events(&mut self) -> bool {
        loop {
            match self.events.try_recv() {
                Ok(ControllerEvent::Shutdown) => return false,
                Ok(event) => self.handle_event(event),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        debug!("Controller {} handles event {:?}", self.name, event);
        match event {
            ControllerEvent::AttachDevice { slot, device } => {
                info!(
                    "Controller {}: attach {} to slot {}",
                    self.name,
                    device.name(),
                    slot
                );
                self.slots[slot.as_usize()] = SlotState::Bound(device);
                self.post_event(slot, 0, VIRTIO_SCSI_EVT_RESET_RESCAN);
            }
            ControllerEvent::DetachDevice { slot, cb } => self.detach_device(slot, cb),
            ControllerEvent::AttachLun { slot, lun, device } => {
                match &mut self.slots[slot.as_usize()] {
                    SlotState::Bound(dev) => *dev = device,
                    _ => {
                        warn!("Controller {}: slot {} is not bound", self.name, slot);
                        return;
                    }
                }
                self.post_event(slot, lun, VIRTIO_SCSI_EVT_RESET_RESCAN);
            }
            ControllerEvent::DetachLun {
                slot,
                lun,
                device,
                cb,
            } => {
                match &mut self.slots[slot.as_usize()] {
                    SlotState::Bound(dev) => *dev = device,
                    _ => warn!("Controller {}: slot {} is not bound", self.name, slot),
                }
                self.fail_backlog(
                    |cmd| cmd.slot == slot && cmd.lun_id == lun,
                    VirtioScsiCmdResp::check_condition(SCSI_SENSE_LUN_NOT_SUPPORTED),
                );
                self.lun_drains.push(LunDrain { slot, lun, cb });
            }
            ControllerEvent::StartTransport(rings) => self.start_transport(rings),
            ControllerEvent::StopTransport => {
                if self.rings.is_none() {
                    self.send_notice(HotplugNotice::TransportStopped {
                        vring_bases: Vec::new(),
                    });
                } else {
                    self.stopping = true;
                }
            }
            ControllerEvent::Shutdown => {}
        }
    }

    fn detach_device(&mut self, slot: SlotIndex, cb: Option<RemoveCallback>) {
        let state = std::mem::replace(&mut self.slots[slot.as_usize()], SlotState::Empty);
        match state {
            SlotState::Bound(device) => {
                info!(
                    "Controller {}: draining {} in slot {}",
                    self.name,
                    device.name(),
                    slot
                );
                self.slots[slot.as_usize()] = SlotState::Draining { device, cb };
                self.fail_backlog(
                    |cmd| cmd.slot == slot,
                    VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_BAD_TARGET),
                );
            }
            SlotState::Draining { device, cb: first } => {
                warn!("Controller {}: slot {} is already draining", self.name, slot);
                self.slots[slot.as_usize()] = SlotState::Draining { device, cb: first };
                if let Some(cb) = cb {
                    cb(&self.name, slot);
                }
            }
            SlotState::Empty => {
                self.send_notice(HotplugNotice::DeviceDetached { slot });
                if let Some(cb) = cb {
                    cb(&self.name, slot);
                }
            }
        }
    }

    fn start_transport(&mut self, rings: ActiveRings) {
        if self.rings.is_some() {
            warn!("Controller {}: transport already started", self.name);
            return;
        }
        let queue_num = rings.queues.len();
        info!(
            "Controller {}: transport started with {} queues, features 0x{:x}",
            self.name, queue_num, rings.features
        );
        self.broken = vec![false; queue_num];
        self.need_notify = vec![false; queue_num];
        self.backlog = (0..queue_num).map(|_| VecDeque::new()).collect();
        self.next_queue = 0;
        self.pending_events.clear();
        self.events_missed = false;
        self.stopping = false;
        self.rings = Some(rings);
    }

    fn send_notice(&self, notice: HotplugNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Controller {}: management side is gone", self.name);
        }
    }

    fn features(&self) -> u64 {
        self.rings.as_ref().map_or(0, |r| r.features)
    }

    fn mem(&self) -> Option<Arc<GuestMemory>> {
        self.rings.as_ref().map(|r| r.mem.clone())
    }

    fn pop(&mut self, queue: usize) -> Result<Option<PoppedChain>> {
        let features = self.features();
        match self.rings.as_mut() {
            Some(rings) => rings.queues[queue].vring.pop_avail(&rings.mem, features),
            None => Ok(None),
        }
    }

    /// Write `resp` to the device-writable segments of `head` and return it to the guest.
    fn publish(&mut self, queue: usize, head: u16, iovec: &[ElemIovec], resp: &[u8], used_len: u32) {
        let rings = match self.rings.as_mut() {
            Some(rings) => rings,
            None => {
                warn!(
                    "Controller {}: no vring to return head {} of queue {}",
                    self.name, head, queue
                );
                return;
            }
        };

        let mut len = used_len;
        if !resp.is_empty() {
            if let Err(e) = iov_from_buf(&rings.mem, iovec, resp) {
                error!(
                    "Controller {}: failed to write response of head {} on queue {}: {:?}",
                    self.name, head, queue, e
                );
                len = 0;
            }
        }
        if let Err(e) = rings.queues[queue].vring.add_used(&rings.mem, head, len) {
            error!(
                "Controller {}: failed to add used ring of queue {} for head {}: {:?}",
                self.name, queue, head, e
            );
            self.broken[queue] = true;
            return;
        }
        self.need_notify[queue] = true;
    }

    fn process_ctrl_queue(&mut self) -> bool {
        if self.stopping || self.broken[SCSI_CTRL_QUEUE_IDX] {
            return false;
        }

        let mut busy = false;
        for _ in 0..self.tunables.max_batch {
            match self.pop(SCSI_CTRL_QUEUE_IDX) {
                Ok(Some(PoppedChain::Element(elem))) => {
                    ControllerStats::inc(&self.stats.ctrl_requests);
                    self.handle_ctrl(elem);
                }
                Ok(Some(PoppedChain::Malformed { index, error, .. })) => {
                    ControllerStats::inc(&self.stats.malformed_chains);
                    error!("Controller {}: ctrl queue: {:?}", self.name, error);
                    self.publish(SCSI_CTRL_QUEUE_IDX, index, &[], &[], 0);
                }
                Ok(Some(PoppedChain::Discarded { head, error })) => {
                    ControllerStats::inc(&self.stats.malformed_chains);
                    error!(
                        "Controller {}: ctrl queue discards head {}: {:?}",
                        self.name, head, error
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Controller {}: ctrl queue is broken: {:?}", self.name, e);
                    self.broken[SCSI_CTRL_QUEUE_IDX] = true;
                    break;
                }
            }
            busy = true;
        }
        busy
    }

    fn handle_ctrl(&mut self, elem: Element) {
        let mem = match self.mem() {
            Some(mem) => mem,
            None => return,
        };
        let head = elem.index;
        let mut ctrl_type = [0_u8; size_of::<u32>()];
        let size = iov_to_buf(&mem, &elem.out_iovec, &mut ctrl_type).unwrap_or(0);
        if size < ctrl_type.len() {
            error!("Controller {}: ctrl request {} is too short", self.name, head);
            self.publish(SCSI_CTRL_QUEUE_IDX, head, &[], &[], 0);
            return;
        }
        let in_size = Element::iovec_size(&elem.in_iovec);

        match LittleEndian::read_u32(&ctrl_type) {
            VIRTIO_SCSI_T_TMF => {
                let mut req = VirtioScsiCtrlTmfReq::default();
                let size = iov_to_buf(&mem, &elem.out_iovec, req.as_mut_bytes()).unwrap_or(0);
                if size < size_of::<VirtioScsiCtrlTmfReq>()
                    || in_size < size_of::<VirtioScsiCtrlTmfResp>() as u64
                {
                    error!("Controller {}: invalid tmf request {}", self.name, head);
                    self.publish(SCSI_CTRL_QUEUE_IDX, head, &[], &[], 0);
                    return;
                }
                let resp = VirtioScsiCtrlTmfResp {
                    response: self.tmf_response(&req),
                };
                self.publish(
                    SCSI_CTRL_QUEUE_IDX,
                    head,
                    &elem.in_iovec,
                    resp.as_bytes(),
                    size_of::<VirtioScsiCtrlTmfResp>() as u32,
                );
            }
            VIRTIO_SCSI_T_AN_QUERY | VIRTIO_SCSI_T_AN_SUBSCRIBE => {
                let mut req = VirtioScsiCtrlAnReq::default();
                let size = iov_to_buf(&mem, &elem.out_iovec, req.as_mut_bytes()).unwrap_or(0);
                if size < size_of::<VirtioScsiCtrlAnReq>()
                    || in_size < size_of::<VirtioScsiCtrlAnResp>() as u64
                {
                    error!("Controller {}: invalid an request {}", self.name, head);
                    self.publish(SCSI_CTRL_QUEUE_IDX, head, &[], &[], 0);
                    return;
                }
                // No asynchronous notification is supported.
                let resp = VirtioScsiCtrlAnResp {
                    event_actual: 0,
                    response: VIRTIO_SCSI_S_OK,
                };
                self.publish(
                    SCSI_CTRL_QUEUE_IDX,
                    head,
                    &elem.in_iovec,
                    resp.as_bytes(),
                    size_of::<VirtioScsiCtrlAnResp>() as u32,
                );
            }
            other => {
                error!(
                    "Controller {}: unknown ctrl request type {}",
                    self.name, other
                );
                self.publish(SCSI_CTRL_QUEUE_IDX, head, &[], &[], 0);
            }
        }
    }

    fn tmf_response(&self, req: &VirtioScsiCtrlTmfReq) -> u8 {
        let subtype = req.subtype;
        let device = virtio_scsi_lun_target(req.lun).and_then(|(target, lun)| {
            let slot = SlotIndex::try_from(u32::from(target)).ok()?;
            match &self.slots[slot.as_usize()] {
                SlotState::Bound(dev) => Some((dev.clone(), slot, lun)),
                _ => None,
            }
        });
        let present = match (subtype, device) {
            (VIRTIO_SCSI_T_TMF_I_T_NEXUS_RESET, Some(_)) => true,
            (VIRTIO_SCSI_T_TMF_LOGICAL_UNIT_RESET, Some((dev, slot, lun))) => {
                dev.lun(lun).is_some() && !self.lun_draining(slot, lun)
            }
            _ => false,
        };
        debug!(
            "Controller {}: tmf subtype {} present {}",
            self.name, subtype, present
        );
        if present {
            VIRTIO_SCSI_S_FUNCTION_SUCCEEDED
        } else {
            VIRTIO_SCSI_S_FUNCTION_REJECTED
        }
    }

    fn process_request_queues(&mut self) -> bool {
        let queue_num = self.rings.as_ref().map_or(0, |r| r.queues.len());
        let req_num = queue_num.saturating_sub(SCSI_EVENT_QUEUE_IDX + 1);
        if req_num == 0 {
            return false;
        }

        let mut busy = false;
        for i in 0..req_num {
            let queue = SCSI_EVENT_QUEUE_IDX + 1 + (self.next_queue + i) % req_num;
            busy |= self.process_request_queue(queue);
        }
        self.next_queue = (self.next_queue + 1) % req_num;
        busy
    }

    /// Requests handed to a backend and not completed yet.
    fn submitted(&self) -> usize {
        let waiting: usize = self.backlog.iter().map(|b| b.len()).sum();
        self.inflight.len().saturating_sub(waiting)
    }

    /// Submit refused commands again in order. Stops at the first one the
    /// backend refuses again, and skips the queue when nothing progressed
    /// since the last refusal.
    fn retry_backlog(&mut self, queue: usize) -> bool {
        let mut busy = false;
        while let Some(&key) = self.backlog[queue].front() {
            let refused_at = match self.inflight.get(&key) {
                Some(cmd) => cmd.refused_at,
                None => {
                    self.backlog[queue].pop_front();
                    continue;
                }
            };
            if refused_at == Some(self.progress) {
                break;
            }
            self.backlog[queue].pop_front();
            if self.submit(key) {
                self.backlog[queue].push_front(key);
                break;
            }
            busy = true;
        }
        busy
    }

    fn process_request_queue(&mut self, queue: usize) -> bool {
        let mut busy = self.retry_backlog(queue);

        if self.stopping || self.broken[queue] {
            return busy;
        }
        for _ in 0..self.tunables.max_batch {
            // New chains stay in the avail ring while a refused command waits.
            if !self.backlog[queue].is_empty() {
                break;
            }
            match self.pop(queue) {
                Ok(Some(chain)) => self.handle_chain(queue, chain),
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "Controller {}: request queue {} is broken: {:?}",
                        self.name, queue, e
                    );
                    self.broken[queue] = true;
                    break;
                }
            }
            busy = true;
        }
        busy
    }

    fn handle_chain(&mut self, queue: usize, chain: PoppedChain) {
        match chain {
            PoppedChain::Element(elem) => {
                ControllerStats::inc(&self.stats.requests);
                if self.is_duplicate(queue, elem.index) {
                    return;
                }
                self.handle_cmd(queue, elem);
            }
            PoppedChain::Malformed {
                index,
                partial,
                error,
            } => {
                ControllerStats::inc(&self.stats.malformed_chains);
                error!(
                    "Controller {}: request queue {}: {:?}",
                    self.name, queue, error
                );
                if self.is_duplicate(queue, index) {
                    return;
                }
                if Element::iovec_size(&partial.in_iovec) >= CMD_RESP_SIZE {
                    let resp = VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_FAILURE);
                    self.publish(
                        queue,
                        index,
                        &partial.in_iovec,
                        resp.as_bytes(),
                        cmd_used_len(0),
                    );
                } else {
                    self.publish(queue, index, &[], &[], 0);
                }
            }
            PoppedChain::Discarded { head, error } => {
                ControllerStats::inc(&self.stats.malformed_chains);
                error!(
                    "Controller {}: request queue {} discards head {}: {:?}",
                    self.name, queue, head, error
                );
            }
        }
    }

    /// A head still in flight must not be dispatched or returned twice.
    fn is_duplicate(&self, queue: usize, head: u16) -> bool {
        if self.inflight.contains_key(&(queue, head)) {
            ControllerStats::inc(&self.stats.duplicate_heads);
            error!(
                "Controller {}: head {} of queue {} is still in flight",
                self.name, head, queue
            );
            return true;
        }
        false
    }

    fn handle_cmd(&mut self, queue: usize, elem: Element) {
        let mem = match self.mem() {
            Some(mem) => mem,
            None => return,
        };
        match parse_cmd_request(&mem, elem, self.features()) {
            CmdParse::Ready(req) => self.dispatch(queue, req),
            CmdParse::Respond {
                head,
                resp_iovec,
                resp,
            } => self.publish(queue, head, &resp_iovec, resp.as_bytes(), cmd_used_len(0)),
            CmdParse::NoResponse { head } => self.publish(queue, head, &[], &[], 0),
        }
    }

    fn lun_draining(&self, slot: SlotIndex, lun: u16) -> bool {
        self.lun_drains
            .iter()
            .any(|d| d.slot == slot && d.lun == lun)
    }

    /// Resolve the addressed lun, or the response for a request that cannot reach it.
    fn lookup(
        &self,
        lun: [u8; 8],
    ) -> std::result::Result<(SlotIndex, u16, Arc<dyn ScsiLun>), VirtioScsiCmdResp> {
        let bad_target = || VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_BAD_TARGET);
        let (target, lun_id) = virtio_scsi_lun_target(lun).ok_or_else(bad_target)?;
        let slot = SlotIndex::try_from(u32::from(target)).map_err(|_| bad_target())?;
        match &self.slots[slot.as_usize()] {
            SlotState::Bound(dev) => match dev.lun(lun_id) {
                Some(l) if !self.lun_draining(slot, lun_id) => Ok((slot, lun_id, l.clone())),
                _ => Err(VirtioScsiCmdResp::check_condition(
                    SCSI_SENSE_LUN_NOT_SUPPORTED,
                )),
            },
            _ => Err(bad_target()),
        }
    }

    fn dispatch(&mut self, queue: usize, req: CmdRequest) {
        let (slot, lun_id, lun) = match self.lookup(req.req.lun) {
            Ok(found) => found,
            Err(resp) => {
                if resp.response == VIRTIO_SCSI_S_BAD_TARGET {
                    ControllerStats::inc(&self.stats.bad_target);
                }
                debug!(
                    "Controller {}: request {} cannot reach lun {:?}",
                    self.name, req.head, req.req.lun
                );
                self.publish(
                    queue,
                    req.head,
                    &req.resp_iovec,
                    resp.as_bytes(),
                    cmd_used_len(0),
                );
                return;
            }
        };

        let task = ScsiTask {
            lun: lun_id,
            tag: req.tag(),
            cdb: req.cdb(),
            data_out: req.data_out,
            data_in: req.data_in,
            transfer_len: req.data_out_len + req.data_in_len,
        };
        trace!(
            "Controller {}: queue {} head {} to {} op 0x{:x}",
            self.name,
            queue,
            req.head,
            lun.name(),
            task.cdb[0]
        );
        let key = (queue, req.head);
        self.inflight.insert(
            key,
            InflightCmd {
                slot,
                lun_id,
                generation: 0,
                retries: 0,
                refused_at: None,
                task,
                lun,
                resp_iovec: req.resp_iovec,
                data_in_len: req.data_in_len,
            },
        );
        if self.submit(key) {
            self.backlog[queue].push_back(key);
        }
    }

    /// Hand an in-flight command to its lun. True when the lun refused it as
    /// busy and the caller has to queue it for a retry.
    fn submit(&mut self, key: CmdKey) -> bool {
        let mem = match self.mem() {
            Some(mem) => mem,
            None => return false,
        };
        self.generation += 1;
        let generation = self.generation;
        let (task, lun) = match self.inflight.get_mut(&key) {
            Some(cmd) => {
                cmd.generation = generation;
                (cmd.task.clone(), cmd.lun.clone())
            }
            None => return false,
        };

        let cb = Arc::new(CmdCompleteCb {
            key,
            generation,
            done: AtomicBool::new(false),
            sender: self.completion_tx.clone(),
            poller: self.thread.clone(),
            stats: self.stats.clone(),
            _mem: mem,
        });
        match lun.submit(task, cb) {
            Ok(()) => false,
            Err(SubmitError::Busy) => {
                let retry_limit = self.tunables.retry_limit;
                let progress = self.progress;
                let retried = match self.inflight.get_mut(&key) {
                    Some(cmd) if cmd.retries < retry_limit => {
                        cmd.retries += 1;
                        cmd.refused_at = Some(progress);
                        true
                    }
                    _ => false,
                };
                if retried {
                    ControllerStats::inc(&self.stats.backend_retries);
                } else {
                    ControllerStats::inc(&self.stats.aborted);
                    warn!(
                        "Controller {}: {} stays busy, abort head {} of queue {}",
                        self.name,
                        lun.name(),
                        key.1,
                        key.0
                    );
                    self.finish_cmd(key, ScsiTaskResult::with_status(TASK_ABORTED), true);
                }
                retried
            }
            Err(SubmitError::Failed(msg)) => {
                error!(
                    "Controller {}: {} refused head {} of queue {}: {}",
                    self.name,
                    lun.name(),
                    key.1,
                    key.0,
                    msg
                );
                self.finish_cmd(
                    key,
                    ScsiTaskResult::check_condition(SCSI_SENSE_TARGET_FAILURE),
                    true,
                );
                false
            }
        }
    }

    /// Publish the completion of an in-flight command. Results made up by the
    /// poller transferred no data.
    fn finish_cmd(&mut self, key: CmdKey, mut result: ScsiTaskResult, synthetic: bool) {
        let cmd = match self.inflight.remove(&key) {
            Some(cmd) => cmd,
            None => return,
        };
        if synthetic {
            result.residual = cmd.data_in_len;
        }
        let (resp, filled) = cmd_resp_from_result(&result, cmd.data_in_len);
        ControllerStats::inc(&self.stats.completions);
        self.publish(
            key.0,
            key.1,
            &cmd.resp_iovec,
            resp.as_bytes(),
            cmd_used_len(filled),
        );
    }

    /// Complete an in-flight command with a response made up by the poller.
    fn fail_cmd(&mut self, key: CmdKey, mut resp: VirtioScsiCmdResp) {
        let cmd = match self.inflight.remove(&key) {
            Some(cmd) => cmd,
            None => return,
        };
        resp.resid = std::cmp::min(cmd.data_in_len, u64::from(u32::MAX)) as u32;
        ControllerStats::inc(&self.stats.completions);
        self.publish(
            key.0,
            key.1,
            &cmd.resp_iovec,
            resp.as_bytes(),
            cmd_used_len(0),
        );
    }

    /// Complete backlog commands selected by `pred` without submitting them.
    fn fail_backlog<F>(&mut self, pred: F, resp: VirtioScsiCmdResp)
    where
        F: Fn(&InflightCmd) -> bool,
    {
        let mut failed = Vec::new();
        for backlog in self.backlog.iter_mut() {
            let inflight = &self.inflight;
            backlog.retain(|key| match inflight.get(key) {
                Some(cmd) if pred(cmd) => {
                    failed.push(*key);
                    false
                }
                _ => true,
            });
        }
        for key in failed {
            self.fail_cmd(key, resp);
        }
    }

    fn sweep_completions(&mut self) -> bool {
        let mut busy = false;
        loop {
            let msg = match self.completion_rx.try_recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            busy = true;
            let current = self
                .inflight
                .get(&msg.key)
                .map_or(false, |cmd| cmd.generation == msg.generation);
            if current {
                self.finish_cmd(msg.key, msg.result, false);
            } else {
                debug!(
                    "Controller {}: stale completion of head {} on queue {}",
                    self.name, msg.key.1, msg.key.0
                );
            }
        }
        if busy {
            self.progress += 1;
        }
        busy
    }

    fn slot_busy(&self, slot: SlotIndex) -> bool {
        self.inflight.values().any(|cmd| cmd.slot == slot)
    }

    fn finish_drains(&mut self) {
        for slot in SlotIndex::all() {
            if !matches!(self.slots[slot.as_usize()], SlotState::Draining { .. })
                || self.slot_busy(slot)
            {
                continue;
            }
            let state = std::mem::replace(&mut self.slots[slot.as_usize()], SlotState::Empty);
            if let SlotState::Draining { device, cb } = state {
                info!(
                    "Controller {}: {} detached from slot {}",
                    self.name,
                    device.name(),
                    slot
                );
                self.post_event(slot, 0, VIRTIO_SCSI_EVT_RESET_REMOVED);
                self.send_notice(HotplugNotice::DeviceDetached { slot });
                if let Some(cb) = cb {
                    cb(&self.name, slot);
                }
            }
        }

        let drains = std::mem::take(&mut self.lun_drains);
        for drain in drains {
            let busy = self
                .inflight
                .values()
                .any(|cmd| cmd.slot == drain.slot && cmd.lun_id == drain.lun);
            if busy {
                self.lun_drains.push(drain);
                continue;
            }
            info!(
                "Controller {}: lun {} detached from slot {}",
                self.name, drain.lun, drain.slot
            );
            self.post_event(drain.slot, drain.lun, VIRTIO_SCSI_EVT_RESET_REMOVED);
            self.send_notice(HotplugNotice::LunDetached {
                slot: drain.slot,
                lun: drain.lun,
            });
            if let Some(cb) = drain.cb {
                cb(&self.name, drain.slot);
            }
        }
    }

    fn finish_stop(&mut self) {
        if !self.stopping || !self.inflight.is_empty() {
            return;
        }
        self.notify_guest();
        self.stopping = false;
        let vring_bases = match self.rings.take() {
            Some(rings) => rings
                .queues
                .iter()
                .map(|q| q.vring.get_queue_config().vring_base())
                .collect(),
            None => Vec::new(),
        };
        self.broken.clear();
        self.need_notify.clear();
        self.backlog.clear();
        self.pending_events.clear();
        info!(
            "Controller {}: transport stopped at {:?}",
            self.name, vring_bases
        );
        self.send_notice(HotplugNotice::TransportStopped { vring_bases });
    }

    fn notify_guest(&mut self) {
        let rings = match self.rings.as_mut() {
            Some(rings) => rings,
            None => return,
        };
        for (queue, need) in self.need_notify.iter_mut().enumerate() {
            if !*need {
                continue;
            }
            *need = false;
            if rings.queues[queue]
                .vring
                .should_notify(&rings.mem, rings.features)
            {
                if let Err(e) = rings.call_evts[queue].write(1) {
                    error!(
                        "Controller {}: failed to notify queue {}: {:?}",
                        self.name, queue, e
                    );
                }
            }
        }
    }

    /// Queue a transport reset event for the guest when it asked for hotplug events.
    fn post_event(&mut self, slot: SlotIndex, lun: u16, reason: u32) {
        if self.rings.is_none()
            || self.stopping
            || !virtio_has_feature(self.features(), VIRTIO_SCSI_F_HOTPLUG)
        {
            return;
        }
        if self.pending_events.len() >= MAX_PENDING_EVENTS {
            self.pending_events.pop_front();
            ControllerStats::inc(&self.stats.events_missed);
            self.events_missed = true;
        }
        self.pending_events
            .push_back(VirtioScsiEvent::transport_reset(slot.raw(), lun, reason));
    }

    fn flush_events(&mut self) -> bool {
        if (self.pending_events.is_empty() && !self.events_missed)
            || self.broken[SCSI_EVENT_QUEUE_IDX]
        {
            return false;
        }

        let mut busy = false;
        while !self.pending_events.is_empty() || self.events_missed {
            match self.pop(SCSI_EVENT_QUEUE_IDX) {
                Ok(Some(PoppedChain::Element(elem))) => {
                    busy = true;
                    if Element::iovec_size(&elem.in_iovec) < size_of::<VirtioScsiEvent>() as u64 {
                        error!(
                            "Controller {}: event buffer {} is too small",
                            self.name, elem.index
                        );
                        self.publish(SCSI_EVENT_QUEUE_IDX, elem.index, &[], &[], 0);
                        continue;
                    }
                    let mut event = self.pending_events.pop_front().unwrap_or_default();
                    if self.events_missed {
                        event.event |= VIRTIO_SCSI_T_EVENTS_MISSED;
                        self.events_missed = false;
                    }
                    ControllerStats::inc(&self.stats.events_sent);
                    self.publish(
                        SCSI_EVENT_QUEUE_IDX,
                        elem.index,
                        &elem.in_iovec,
                        event.as_bytes(),
                        size_of::<VirtioScsiEvent>() as u32,
                    );
                }
                Ok(Some(PoppedChain::Malformed { index, error, .. })) => {
                    busy = true;
                    ControllerStats::inc(&self.stats.malformed_chains);
                    error!("Controller {}: event queue: {:?}", self.name, error);
                    self.publish(SCSI_EVENT_QUEUE_IDX, index, &[], &[], 0);
                }
                Ok(Some(PoppedChain::Discarded { head, error })) => {
                    ControllerStats::inc(&self.stats.malformed_chains);
                    error!(
                        "Controller {}: event queue discards head {}: {:?}",
                        self.name, head, error
                    );
                }
                Ok(None) => {
                    if !self.pending_events.is_empty() {
                        warn!(
                            "Controller {}: no event buffer, drop {} events",
                            self.name,
                            self.pending_events.len()
                        );
                        for _ in self.pending_events.drain(..) {
                            ControllerStats::inc(&self.stats.events_missed);
                        }
                        self.events_missed = true;
                    }
                    break;
                }
                Err(e) => {
                    error!("Controller {}: event queue is broken: {:?}", self.name, e);
                    self.broken[SCSI_EVENT_QUEUE_IDX] = true;
                    self.pending_events.clear();
                    self.events_missed = false;
                    break;
                }
            }
        }
        busy
    }
}
