use std::cmp::{max, min};
use std::collections::VecDeque;
use std::sync::Arc;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use crate::buffers::{BufferAllocator, HeapAllocator};
use crate::clock::time_diff;
use crate::config::{KcpConfig, NodelayParams, DEFAULT_DEAD_LINK, DEFAULT_FAST_RESEND_LIMIT, DEFAULT_INTERVAL_MILLIS, DEFAULT_MTU, DEFAULT_SEND_WINDOW, MAX_INTERVAL_MILLIS, MAX_MTU, MIN_INTERVAL_MILLIS, MIN_MTU, MIN_RECEIVE_WINDOW};
use crate::engine::segment::{Command, SegmentHeader, SEGMENT_HEADER_LEN};
use crate::engine::{ArqEngine, EngineError};
use crate::safe_converter::{PrecheckedCast, SafeCast, SaturatingCast};

const RTO_NODELAY_MIN: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;

const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

/// the clock is considered to have jumped if it moves further than this between updates
const MAX_CLOCK_SLAP: i32 = 10_000;

/// A packet may consist of fewer fragments than this. The receiver must be able to buffer all
///  fragments of a packet, which is why the receive window never drops below this value.
const MAX_FRAGMENTS: usize = MIN_RECEIVE_WINDOW as usize;


struct Segment {
    /// number of fragments of the same packet following this one
    frg: u8,
    sn: u32,
    resend_ts: u32,
    rto: u32,
    /// number of acks for later segments received since this segment was last sent
    fast_ack: u32,
    xmit: u32,
    data: BytesMut,
}

impl Segment {
    fn new(frg: u8, data: BytesMut) -> Segment {
        Segment {
            frg,
            sn: 0,
            resend_ts: 0,
            rto: 0,
            fast_ack: 0,
            xmit: 0,
            data,
        }
    }
}


/// The KCP protocol state machine for one conversation.
///
/// Outbound packets are split into segments of at most MSS bytes and wait in the send queue
///  until the send window (the minimum of the local send window, the peer's advertised receive
///  window and - with congestion control - the congestion window) admits them into the send
///  buffer. Segments in the send buffer are retransmitted on timeout or after `fast_resend`
///  acknowledgements for later segments, until they are acknowledged selectively (ACK) or
///  cumulatively (una field of every segment).
///
/// Inbound PUSH segments inside the receive window are acknowledged and buffered, and moved to
///  the receive queue once they are contiguous. A packet is available when all its fragments
///  are in the receive queue.
pub struct KcpEngine {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    /// first unacknowledged sequence number
    snd_una: u32,
    /// sequence number of the next segment admitted to the send buffer
    snd_nxt: u32,
    /// sequence number of the next segment expected in order
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u8,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    xmit: u32,

    nodelay: bool,
    ts_probe: u32,
    probe_wait: u32,
    dead_link: u32,
    fast_resend: u32,
    fast_limit: u32,
    nocwnd: bool,

    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    /// (sn, ts) of received segments to be acknowledged in the next flush
    acklist: Vec<(u32, u32)>,

    allocator: Arc<dyn BufferAllocator>,
    /// frame under construction during flush
    buffer: BytesMut,
}

impl KcpEngine {
    pub fn new(conv: u32) -> KcpEngine {
        Self::with_allocator(conv, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(conv: u32, allocator: Arc<dyn BufferAllocator>) -> KcpEngine {
        KcpEngine {
            conv,
            mtu: DEFAULT_MTU,
            mss: DEFAULT_MTU - SEGMENT_HEADER_LEN,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEFAULT,
            rx_minrto: RTO_MIN,
            snd_wnd: DEFAULT_SEND_WINDOW.safe_cast(),
            rcv_wnd: MIN_RECEIVE_WINDOW.safe_cast(),
            rmt_wnd: MIN_RECEIVE_WINDOW.safe_cast(),
            // starting with a window of one segment allows a flush before the first ack
            cwnd: 1,
            incr: (DEFAULT_MTU - SEGMENT_HEADER_LEN).prechecked_cast(),
            probe: 0,
            current: 0,
            interval: DEFAULT_INTERVAL_MILLIS,
            ts_flush: DEFAULT_INTERVAL_MILLIS,
            updated: false,
            xmit: 0,
            nodelay: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: DEFAULT_DEAD_LINK,
            fast_resend: 0,
            fast_limit: DEFAULT_FAST_RESEND_LIMIT,
            nocwnd: false,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            allocator,
            buffer: BytesMut::with_capacity(DEFAULT_MTU),
        }
    }

    pub fn with_config(conv: u32, config: &KcpConfig, allocator: Arc<dyn BufferAllocator>) -> anyhow::Result<KcpEngine> {
        config.validate()?;

        let mut engine = Self::with_allocator(conv, allocator);
        engine.configure(config)?;
        Ok(engine)
    }

    /// Applies all tunables of `config`
    pub fn configure(&mut self, config: &KcpConfig) -> Result<(), EngineError> {
        self.set_mtu(config.mtu)?;
        self.set_window_sizes(Some(config.send_window), Some(config.receive_window));
        self.set_nodelay_params(config.nodelay_params());
        self.set_dead_link(config.dead_link);
        self.set_fast_resend_limit(config.fast_resend_limit);
        Ok(())
    }

    pub fn set_dead_link(&mut self, dead_link: u32) {
        if dead_link > 0 {
            self.dead_link = dead_link;
        }
    }

    /// 0 means no limit
    pub fn set_fast_resend_limit(&mut self, fast_limit: u32) {
        self.fast_limit = fast_limit;
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// current retransmission timeout in milliseconds
    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn congestion_window(&self) -> u32 {
        self.cwnd
    }

    /// the peer's most recently advertised receive window
    pub fn remote_window(&self) -> u32 {
        self.rmt_wnd
    }

    /// total number of timeout retransmissions
    pub fn num_retransmissions(&self) -> u32 {
        self.xmit
    }

    /// the current nodelay settings, with every field present
    pub fn nodelay_params(&self) -> NodelayParams {
        NodelayParams {
            nodelay: Some(self.nodelay),
            interval_millis: Some(self.interval),
            fast_resend: Some(self.fast_resend),
            congestion_control: Some(!self.nocwnd),
        }
    }

    fn max_packet_len(&self) -> usize {
        (MAX_FRAGMENTS - 1) * self.mss
    }

    fn wnd_unused(&self) -> u16 {
        let rcv_wnd: usize = self.rcv_wnd.safe_cast();
        if self.rcv_queue.len() < rcv_wnd {
            let unused: u32 = (rcv_wnd - self.rcv_queue.len()).prechecked_cast();
            unused.saturating_cast()
        }
        else {
            0
        }
    }

    fn release(&self, segment: Segment) {
        self.allocator.release(segment.data);
    }

    fn update_ack(&mut self, rtt: u32) {
        let rtt = rtt as u64;
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt as u32;
            self.rx_rttval = (rtt / 2) as u32;
        }
        else {
            let srtt = self.rx_srtt as u64;
            let delta = rtt.abs_diff(srtt);
            self.rx_rttval = ((3 * self.rx_rttval as u64 + delta) / 4) as u32;
            self.rx_srtt = max(1, (7 * srtt + rtt) / 8) as u32;
        }

        let rto = self.rx_srtt as u64 + max(self.interval as u64, 4 * self.rx_rttval as u64);
        self.rx_rto = rto.clamp(self.rx_minrto as u64, RTO_MAX as u64) as u32;
        trace!("conv {}: rtt {} ms, srtt {} ms, rto {} ms", self.conv, rtt, self.rx_srtt, self.rx_rto);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    /// discard all segments the peer acknowledged cumulatively
    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if time_diff(una, seg.sn) <= 0 {
                break;
            }
            if let Some(seg) = self.snd_buf.pop_front() {
                self.release(seg);
            }
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        let mut found = None;
        for (idx, seg) in self.snd_buf.iter().enumerate() {
            if seg.sn == sn {
                found = Some(idx);
                break;
            }
            if time_diff(sn, seg.sn) < 0 {
                break;
            }
        }

        if let Some(seg) = found.and_then(|idx| self.snd_buf.remove(idx)) {
            self.release(seg);
        }
    }

    /// count the ack for `sn` against all earlier segments still in flight
    fn parse_fast_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for seg in self.snd_buf.iter_mut() {
            if time_diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fast_ack += 1;
            }
        }
    }

    fn parse_data(&mut self, segment: Segment) {
        let sn = segment.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            self.release(segment);
            return;
        }

        let mut insert_at = self.rcv_buf.len();
        let mut repeat = false;
        for (idx, existing) in self.rcv_buf.iter().enumerate().rev() {
            if existing.sn == sn {
                repeat = true;
                break;
            }
            if time_diff(sn, existing.sn) > 0 {
                break;
            }
            insert_at = idx;
        }

        if repeat {
            trace!("conv {}: dropping duplicate segment {}", self.conv, sn);
            self.release(segment);
        }
        else {
            self.rcv_buf.insert(insert_at, segment);
        }

        self.move_to_receive_queue();
    }

    /// moves contiguous segments from the receive buffer to the receive queue, as long as
    ///  the receive window permits
    fn move_to_receive_queue(&mut self) {
        let rcv_wnd: usize = self.rcv_wnd.safe_cast();
        loop {
            match self.rcv_buf.front() {
                Some(seg) if seg.sn == self.rcv_nxt && self.rcv_queue.len() < rcv_wnd => {}
                _ => break,
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn grow_congestion_window(&mut self) {
        if self.cwnd >= self.rmt_wnd {
            return;
        }

        let mss: u32 = self.mss.prechecked_cast();
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr = self.incr.saturating_add(mss);
        }
        else {
            if self.incr < mss {
                self.incr = mss;
            }
            let step = (mss as u64 * mss as u64) / self.incr as u64 + (mss / 16) as u64;
            self.incr = self.incr.saturating_add(step.min(u32::MAX as u64) as u32);
            if (self.cwnd + 1).saturating_mul(mss) <= self.incr {
                self.cwnd = self.incr.saturating_add(mss - 1) / max(mss, 1);
            }
        }

        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd.saturating_mul(mss);
        }
    }
}

/// hands the frame under construction to the output if `needed` more bytes would exceed the MTU
fn make_room(buffer: &mut BytesMut, needed: usize, mtu: usize, output: &mut dyn FnMut(&[u8])) {
    if !buffer.is_empty() && buffer.len() + needed > mtu {
        trace!("emitting frame of {} bytes", buffer.len());
        output(&buffer[..]);
        buffer.clear();
    }
}

impl ArqEngine for KcpEngine {
    fn conv(&self) -> u32 {
        self.conv
    }

    fn input(&mut self, frame: &[u8]) -> Result<(), EngineError> {
        if frame.len() < SEGMENT_HEADER_LEN {
            return Err(EngineError::FrameTooShort);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        let mut buf = frame;
        while buf.len() >= SEGMENT_HEADER_LEN {
            let header = SegmentHeader::deser(&mut buf)?;
            if header.conv != self.conv {
                return Err(EngineError::ConversationMismatch { expected: self.conv, actual: header.conv });
            }

            let (payload, rest) = buf.split_at(header.payload_len());
            buf = rest;

            self.rmt_wnd = header.wnd.safe_cast();
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    let rtt = time_diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    max_ack = match max_ack {
                        Some(prev) if time_diff(header.sn, prev) <= 0 => Some(prev),
                        _ => Some(header.sn),
                    };
                }
                Command::Push => {
                    if time_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        if time_diff(header.sn, self.rcv_nxt) >= 0 {
                            let mut data = self.allocator.allocate(payload.len());
                            data.put_slice(payload);

                            let mut segment = Segment::new(header.frg, data);
                            segment.sn = header.sn;
                            self.parse_data(segment);
                        }
                    }
                    else {
                        debug!("conv {}: segment {} is outside the receive window", self.conv, header.sn);
                    }
                }
                Command::WindowProbe => {
                    self.probe |= ASK_TELL;
                }
                Command::WindowSize => {}
            }
        }

        if let Some(sn) = max_ack {
            self.parse_fast_ack(sn);
        }

        if time_diff(self.snd_una, prev_una) > 0 {
            self.grow_congestion_window();
        }

        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let count = if data.len() <= self.mss {
            1
        }
        else {
            data.len().div_ceil(self.mss)
        };

        if count >= MAX_FRAGMENTS {
            return Err(EngineError::PacketTooLarge { len: data.len(), max_len: self.max_packet_len() });
        }

        for i in 0..count {
            let start = i * self.mss;
            let end = min(start + self.mss, data.len());

            let mut buf = self.allocator.allocate(end - start);
            buf.put_slice(&data[start..end]);
            self.snd_queue.push_back(Segment::new((count - i - 1).prechecked_cast(), buf));
        }

        trace!("conv {}: queued packet of {} bytes as {} segment(s)", self.conv, data.len(), count);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let size = self.peek_size().ok_or(EngineError::NothingToReceive)?;
        if size > buf.len() {
            return Err(EngineError::BufferTooSmall { required: size, available: buf.len() });
        }

        let rcv_wnd: usize = self.rcv_wnd.safe_cast();
        let recover = self.rcv_queue.len() >= rcv_wnd;

        let mut offset = 0;
        while let Some(seg) = self.rcv_queue.pop_front() {
            let len = seg.data.len();
            buf[offset..offset + len].copy_from_slice(&seg.data);
            offset += len;

            let last = seg.frg == 0;
            self.release(seg);
            if last {
                break;
            }
        }

        self.move_to_receive_queue();

        if recover && self.rcv_queue.len() < rcv_wnd {
            // the window was closed, tell the peer it is open again
            self.probe |= ASK_TELL;
        }

        Ok(offset)
    }

    fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }

        let frg: usize = first.frg.safe_cast();
        if self.rcv_queue.len() < frg + 1 {
            return None;
        }

        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    fn update(&mut self, current: u32, output: &mut dyn FnMut(&[u8])) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-MAX_CLOCK_SLAP..MAX_CLOCK_SLAP).contains(&slap) {
            debug!("conv {}: clock jumped by {} ms", self.conv, slap);
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(output);
        }
    }

    fn flush(&mut self, output: &mut dyn FnMut(&[u8])) {
        let current = self.current;

        let template = SegmentHeader {
            conv: self.conv,
            cmd: Command::Ack,
            frg: 0,
            wnd: self.wnd_unused(),
            ts: 0,
            sn: 0,
            una: self.rcv_nxt,
            len: 0,
        };

        for &(sn, ts) in &self.acklist {
            make_room(&mut self.buffer, SEGMENT_HEADER_LEN, self.mtu, output);
            SegmentHeader { sn, ts, ..template }.ser(&mut self.buffer);
        }
        self.acklist.clear();

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            }
            else if time_diff(current, self.ts_probe) >= 0 {
                self.probe_wait = max(self.probe_wait, PROBE_INIT);
                self.probe_wait = min(self.probe_wait + self.probe_wait / 2, PROBE_LIMIT);
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        }
        else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            trace!("conv {}: probing remote window", self.conv);
            make_room(&mut self.buffer, SEGMENT_HEADER_LEN, self.mtu, output);
            SegmentHeader { cmd: Command::WindowProbe, ..template }.ser(&mut self.buffer);
        }
        if self.probe & ASK_TELL != 0 {
            make_room(&mut self.buffer, SEGMENT_HEADER_LEN, self.mtu, output);
            SegmentHeader { cmd: Command::WindowSize, ..template }.ser(&mut self.buffer);
        }
        self.probe = 0;

        let mut effective_wnd = min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            effective_wnd = min(self.cwnd, effective_wnd);
        }

        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(effective_wnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            seg.resend_ts = current;
            seg.rto = self.rx_rto;
            seg.fast_ack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let resent = if self.fast_resend > 0 { self.fast_resend } else { u32::MAX };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut change = false;
        let mut lost = false;

        for seg in self.snd_buf.iter_mut() {
            let mut need_send = false;

            if seg.xmit == 0 {
                need_send = true;
                seg.xmit += 1;
                seg.rto = self.rx_rto;
                seg.resend_ts = current.wrapping_add(seg.rto).wrapping_add(rtomin);
            }
            else if time_diff(current, seg.resend_ts) >= 0 {
                need_send = true;
                seg.xmit += 1;
                self.xmit += 1;
                let step = if self.nodelay { seg.rto / 2 } else { max(seg.rto, self.rx_rto) };
                seg.rto = min(seg.rto.saturating_add(step), RTO_MAX);
                seg.resend_ts = current.wrapping_add(seg.rto);
                lost = true;
                trace!("conv {}: retransmitting segment {} after timeout (transmission #{})", self.conv, seg.sn, seg.xmit);
            }
            else if seg.fast_ack >= resent && (seg.xmit <= self.fast_limit || self.fast_limit == 0) {
                need_send = true;
                seg.xmit += 1;
                seg.fast_ack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                change = true;
                trace!("conv {}: fast retransmission of segment {}", self.conv, seg.sn);
            }

            if need_send {
                let header = SegmentHeader {
                    cmd: Command::Push,
                    frg: seg.frg,
                    ts: current,
                    sn: seg.sn,
                    ..template
                }.with_payload_len(seg.data.len());

                make_room(&mut self.buffer, header.serialized_len(), self.mtu, output);
                header.ser(&mut self.buffer);
                self.buffer.put_slice(&seg.data);

                if seg.xmit >= self.dead_link && !self.dead {
                    warn!("conv {}: segment {} was sent {} times without acknowledgement - link is dead", self.conv, seg.sn, seg.xmit);
                    self.dead = true;
                }
            }
        }

        if !self.buffer.is_empty() {
            trace!("emitting frame of {} bytes", self.buffer.len());
            output(&self.buffer[..]);
            self.buffer.clear();
        }

        let mss: u32 = self.mss.prechecked_cast();
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = max(inflight / 2, THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(mss);
        }
        if lost {
            self.ssthresh = max(effective_wnd / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = mss;
        }
    }

    fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if time_diff(current, ts_flush).unsigned_abs() >= MAX_CLOCK_SLAP as u32 {
            ts_flush = current;
        }

        if time_diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = time_diff(ts_flush, current) as u32;
        let mut tm_packet = u32::MAX;
        for seg in &self.snd_buf {
            let diff = time_diff(seg.resend_ts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = min(tm_packet, diff as u32);
        }

        let minimal = min(min(tm_packet, tm_flush), self.interval);
        current.wrapping_add(minimal)
    }

    fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    fn set_mtu(&mut self, mtu: usize) -> Result<(), EngineError> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(EngineError::InvalidMtu(mtu));
        }

        self.mtu = mtu;
        self.mss = mtu - SEGMENT_HEADER_LEN;
        self.buffer.reserve(mtu);
        Ok(())
    }

    fn set_window_sizes(&mut self, send_window: Option<u16>, receive_window: Option<u16>) {
        if let Some(snd_wnd) = send_window.filter(|&w| w > 0) {
            self.snd_wnd = snd_wnd.safe_cast();
        }
        if let Some(rcv_wnd) = receive_window.filter(|&w| w > 0) {
            self.rcv_wnd = max(rcv_wnd, MIN_RECEIVE_WINDOW).safe_cast();
        }
    }

    fn set_nodelay_params(&mut self, params: NodelayParams) {
        if let Some(nodelay) = params.nodelay {
            self.nodelay = nodelay;
            self.rx_minrto = if nodelay { RTO_NODELAY_MIN } else { RTO_MIN };
        }
        if let Some(interval) = params.interval_millis {
            self.interval = interval.clamp(MIN_INTERVAL_MILLIS, MAX_INTERVAL_MILLIS);
        }
        if let Some(fast_resend) = params.fast_resend {
            self.fast_resend = fast_resend;
        }
        if let Some(congestion_control) = params.congestion_control {
            self.nocwnd = !congestion_control;
        }
    }

    fn is_dead_link(&self) -> bool {
        self.dead
    }
}

impl Drop for KcpEngine {
    fn drop(&mut self) {
        let queues = [&mut self.snd_queue, &mut self.rcv_queue, &mut self.snd_buf, &mut self.rcv_buf];
        for queue in queues {
            for seg in queue.drain(..) {
                self.allocator.release(seg.data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use rstest::rstest;

    fn flush(engine: &mut KcpEngine) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        engine.flush(&mut |frame: &[u8]| frames.push(frame.to_vec()));
        frames
    }

    fn update(engine: &mut KcpEngine, current: u32) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        engine.update(current, &mut |frame: &[u8]| frames.push(frame.to_vec()));
        frames
    }

    fn decode(frame: &[u8]) -> Vec<SegmentHeader> {
        let mut result = Vec::new();
        let mut buf = frame;
        while !buf.is_empty() {
            let header = SegmentHeader::deser(&mut buf).unwrap();
            buf = &buf[header.payload_len()..];
            result.push(header);
        }
        result
    }

    fn pushes(frames: &[Vec<u8>]) -> Vec<SegmentHeader> {
        frames.iter()
            .flat_map(|f| decode(f))
            .filter(|h| h.cmd == Command::Push)
            .collect()
    }

    fn receive_all(engine: &mut KcpEngine) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some(size) = engine.peek_size() {
            let mut buf = vec![0; size];
            assert_eq!(engine.recv(&mut buf).unwrap(), size);
            result.push(buf);
        }
        result
    }

    fn small_mtu_engine(conv: u32) -> KcpEngine {
        let mut engine = KcpEngine::new(conv);
        engine.set_mtu(50).unwrap();
        engine.set_nodelay_params(NodelayParams { congestion_control: Some(false), ..NodelayParams::UNCHANGED });
        engine
    }

    #[rstest]
    #[case::empty(0, vec![0])]
    #[case::one(1, vec![0])]
    #[case::exactly_mss(26, vec![0])]
    #[case::mss_plus_one(27, vec![1, 0])]
    #[case::three(60, vec![2, 1, 0])]
    fn test_send_fragments(#[case] len: usize, #[case] expected_frg: Vec<u8>) {
        let mut engine = small_mtu_engine(1);
        engine.send(&vec![7; len]).unwrap();

        assert_eq!(engine.wait_snd(), expected_frg.len());
        let frg = engine.snd_queue.iter().map(|s| s.frg).collect::<Vec<_>>();
        assert_eq!(frg, expected_frg);
        let total: usize = engine.snd_queue.iter().map(|s| s.data.len()).sum();
        assert_eq!(total, len);
    }

    #[test]
    fn test_send_too_large() {
        let mut engine = small_mtu_engine(1);
        let max_len = 127 * 26;

        assert!(engine.send(&vec![0; max_len]).is_ok());
        assert_eq!(
            engine.send(&vec![0; max_len + 1]),
            Err(EngineError::PacketTooLarge { len: max_len + 1, max_len }),
        );
    }

    #[rstest]
    #[case::short(vec![1, 2, 3], EngineError::FrameTooShort)]
    #[case::wrong_conv(vec![2,0,0,0, 81,0,128,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0], EngineError::ConversationMismatch { expected: 1, actual: 2 })]
    #[case::bad_len(vec![1,0,0,0, 81,0,128,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 5,0,0,0, 1], EngineError::MalformedSegment)]
    #[case::bad_cmd(vec![1,0,0,0, 99,0,128,0, 0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0], EngineError::UnknownCommand(99))]
    fn test_input_errors(#[case] frame: Vec<u8>, #[case] expected: EngineError) {
        let mut engine = KcpEngine::new(1);
        assert_eq!(engine.input(&frame), Err(expected));
    }

    #[test]
    fn test_transfer_and_ack() {
        let mut a = KcpEngine::new(5);
        let mut b = KcpEngine::new(5);

        a.send(b"hello").unwrap();
        assert_eq!(b.peek_size(), None);

        let frames = flush(&mut a);
        assert_eq!(frames.len(), 1);
        for f in &frames {
            b.input(f).unwrap();
        }

        assert_eq!(b.peek_size(), Some(5));
        assert_eq!(receive_all(&mut b), vec![b"hello".to_vec()]);
        assert_eq!(a.wait_snd(), 1);

        let acks = flush(&mut b);
        assert_eq!(acks.len(), 1);
        let decoded = decode(&acks[0]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].cmd, Command::Ack);
        assert_eq!(decoded[0].sn, 0);
        assert_eq!(decoded[0].una, 1);

        a.input(&acks[0]).unwrap();
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn test_zero_length_packet() {
        let mut a = KcpEngine::new(5);
        let mut b = KcpEngine::new(5);

        a.send(&[]).unwrap();
        for f in flush(&mut a) {
            b.input(&f).unwrap();
        }

        assert_eq!(b.peek_size(), Some(0));
        assert_eq!(b.recv(&mut []), Ok(0));
        assert_eq!(b.peek_size(), None);
        assert_eq!(b.recv(&mut []), Err(EngineError::NothingToReceive));
    }

    #[test]
    fn test_recv_buffer_too_small() {
        let mut a = KcpEngine::new(5);
        let mut b = KcpEngine::new(5);

        a.send(b"abc").unwrap();
        for f in flush(&mut a) {
            b.input(&f).unwrap();
        }

        let mut buf = [0u8; 2];
        assert_eq!(b.recv(&mut buf), Err(EngineError::BufferTooSmall { required: 3, available: 2 }));
        assert_eq!(b.peek_size(), Some(3));
    }

    #[test]
    fn test_fragmented_packet_out_of_order() {
        let mut a = small_mtu_engine(3);
        let mut b = small_mtu_engine(3);

        let payload = (0u8..60).collect::<Vec<_>>();
        a.send(&payload).unwrap();

        let frames = flush(&mut a);
        assert_eq!(frames.len(), 3);

        b.input(&frames[2]).unwrap();
        assert_eq!(b.peek_size(), None);
        b.input(&frames[0]).unwrap();
        assert_eq!(b.peek_size(), None);
        // duplicate
        b.input(&frames[2]).unwrap();
        assert_eq!(b.peek_size(), None);
        b.input(&frames[1]).unwrap();

        assert_eq!(b.peek_size(), Some(60));
        assert_eq!(receive_all(&mut b), vec![payload]);
    }

    #[test]
    fn test_packet_order() {
        let mut a = small_mtu_engine(3);
        let mut b = small_mtu_engine(3);

        for i in 0..5u8 {
            a.send(&[i; 10]).unwrap();
        }
        let mut frames = flush(&mut a);
        frames.reverse();
        for f in &frames {
            b.input(f).unwrap();
        }

        let expected = (0..5u8).map(|i| vec![i; 10]).collect::<Vec<_>>();
        assert_eq!(receive_all(&mut b), expected);
    }

    #[rstest]
    #[case::congestion_control(true, 1)]
    #[case::no_congestion_control(false, 3)]
    fn test_initial_congestion_window(#[case] congestion_control: bool, #[case] expected_pushes: usize) {
        let mut a = KcpEngine::new(1);
        a.set_nodelay_params(NodelayParams { congestion_control: Some(congestion_control), ..NodelayParams::UNCHANGED });

        for _ in 0..3 {
            a.send(b"x").unwrap();
        }

        assert_eq!(pushes(&flush(&mut a)).len(), expected_pushes);
        assert_eq!(a.wait_snd(), 3);
    }

    #[test]
    fn test_congestion_window_grows_with_acks() {
        let mut a = KcpEngine::new(1);
        let mut b = KcpEngine::new(1);
        for _ in 0..4 {
            a.send(b"x").unwrap();
        }

        for f in flush(&mut a) {
            b.input(&f).unwrap();
        }
        for f in flush(&mut b) {
            a.input(&f).unwrap();
        }

        assert_eq!(a.congestion_window(), 2);
        assert_eq!(pushes(&flush(&mut a)).len(), 2);
    }

    #[test]
    fn test_congestion_avoidance_with_max_mtu() {
        let mut a = KcpEngine::new(1);
        let mut b = KcpEngine::new(1);
        a.set_mtu(MAX_MTU).unwrap();
        b.set_mtu(MAX_MTU).unwrap();
        for _ in 0..4 {
            a.send(b"x").unwrap();
        }

        // the second round of acks is past the slow start threshold
        for _ in 0..4 {
            for f in flush(&mut a) {
                b.input(&f).unwrap();
            }
            for f in flush(&mut b) {
                a.input(&f).unwrap();
            }
        }

        assert_eq!(a.wait_snd(), 0);
        assert!(a.congestion_window() >= 2);
        assert!(a.congestion_window() <= a.remote_window());
        assert_eq!(receive_all(&mut b).len(), 4);
    }

    #[test]
    fn test_timeout_retransmission() {
        let mut a = KcpEngine::new(1);
        a.send(b"lost").unwrap();

        assert_eq!(pushes(&update(&mut a, 0)).len(), 1);
        // rto 200 + rto/8
        assert!(pushes(&update(&mut a, 100)).is_empty());
        assert!(pushes(&update(&mut a, 200)).is_empty());

        let resent = pushes(&update(&mut a, 300));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sn, 0);
        assert_eq!(resent[0].ts, 300);
        assert_eq!(a.num_retransmissions(), 1);
        assert_eq!(a.congestion_window(), 1);
    }

    #[test]
    fn test_fast_retransmission() {
        let mut a = small_mtu_engine(1);
        a.set_nodelay_params(NodelayParams { fast_resend: Some(2), ..NodelayParams::UNCHANGED });
        let mut b = small_mtu_engine(1);

        for i in 0..4u8 {
            a.send(&[i; 20]).unwrap();
        }
        let frames = flush(&mut a);
        assert_eq!(frames.len(), 4);

        // frame 0 is lost
        let mut acks = Vec::new();
        for f in &frames[1..3] {
            b.input(f).unwrap();
            acks.extend(flush(&mut b));
        }
        assert_eq!(acks.len(), 2);

        for ack in &acks {
            a.input(ack).unwrap();
        }

        let resent = pushes(&flush(&mut a));
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sn, 0);
        assert_eq!(a.num_retransmissions(), 0);
    }

    #[test]
    fn test_dead_link() {
        let mut a = KcpEngine::new(1);
        a.set_dead_link(3);
        a.send(b"x").unwrap();

        let mut now = 0;
        while !a.is_dead_link() {
            update(&mut a, now);
            now += 100;
            assert!(now < 100_000, "link should be declared dead");
        }
        assert_eq!(a.wait_snd(), 1);
    }

    #[test]
    fn test_window_probe() {
        let mut a = KcpEngine::new(1);

        // peer announces a closed window
        let mut frame = BytesMut::new();
        SegmentHeader { conv: 1, cmd: Command::WindowSize, frg: 0, wnd: 0, ts: 0, sn: 0, una: 0, len: 0 }.ser(&mut frame);
        a.input(&frame).unwrap();
        assert_eq!(a.remote_window(), 0);

        assert!(update(&mut a, 0).is_empty());
        let probe_frames = update(&mut a, 7_000);
        assert_eq!(probe_frames.len(), 1);
        assert_eq!(decode(&probe_frames[0])[0].cmd, Command::WindowProbe);

        // the peer answers a probe with its window size
        let mut b = KcpEngine::new(1);
        b.input(&probe_frames[0]).unwrap();
        let answer = flush(&mut b);
        assert_eq!(answer.len(), 1);
        let decoded = decode(&answer[0]);
        assert_eq!(decoded[0].cmd, Command::WindowSize);
        assert_eq!(decoded[0].wnd, 128);

        a.input(&answer[0]).unwrap();
        assert_eq!(a.remote_window(), 128);
    }

    #[test]
    fn test_check() {
        let mut a = KcpEngine::new(1);
        assert_eq!(a.check(5), 5);

        update(&mut a, 0);
        assert_eq!(a.check(0), 100);
        assert_eq!(a.check(40), 100);
        assert_eq!(a.check(100), 100);

        a.send(b"x").unwrap();
        update(&mut a, 100);
        // next flush at 200, resend at 100 + 225
        assert_eq!(a.check(150), 200);
        update(&mut a, 200);
        update(&mut a, 300);
        assert_eq!(a.check(310), 325);
        assert_eq!(a.check(330), 330);
    }

    #[rstest]
    #[case::too_small(49)]
    #[case::zero(0)]
    #[case::too_big(MAX_MTU + 1)]
    #[case::huge(100_000)]
    fn test_invalid_mtu(#[case] mtu: usize) {
        let mut a = KcpEngine::new(1);
        assert_eq!(a.set_mtu(mtu), Err(EngineError::InvalidMtu(mtu)));
        assert_eq!(a.mtu(), DEFAULT_MTU);
    }

    #[rstest]
    #[case::unchanged(None, None, 32, 128)]
    #[case::send(Some(64), None, 64, 128)]
    #[case::receive(None, Some(256), 32, 256)]
    #[case::receive_raised_to_min(None, Some(16), 32, 128)]
    #[case::zero_is_unchanged(Some(0), Some(0), 32, 128)]
    fn test_window_sizes(#[case] snd: Option<u16>, #[case] rcv: Option<u16>, #[case] expected_snd: u32, #[case] expected_rcv: u32) {
        let mut a = KcpEngine::new(1);
        a.set_window_sizes(snd, rcv);
        assert_eq!(a.snd_wnd, expected_snd);
        assert_eq!(a.rcv_wnd, expected_rcv);
    }

    #[rstest]
    #[case::unchanged(NodelayParams::UNCHANGED, false, 100, 0, false, 100)]
    #[case::nodelay(NodelayParams { nodelay: Some(true), ..NodelayParams::UNCHANGED }, true, 100, 0, false, 30)]
    #[case::interval_clamped_low(NodelayParams { interval_millis: Some(1), ..NodelayParams::UNCHANGED }, false, 10, 0, false, 100)]
    #[case::interval_clamped_high(NodelayParams { interval_millis: Some(9999), ..NodelayParams::UNCHANGED }, false, 5000, 0, false, 100)]
    #[case::resend(NodelayParams { fast_resend: Some(2), ..NodelayParams::UNCHANGED }, false, 100, 2, false, 100)]
    #[case::no_cwnd(NodelayParams { congestion_control: Some(false), ..NodelayParams::UNCHANGED }, false, 100, 0, true, 100)]
    fn test_nodelay_params(#[case] params: NodelayParams, #[case] nodelay: bool, #[case] interval: u32, #[case] fast_resend: u32, #[case] nocwnd: bool, #[case] minrto: u32) {
        let mut a = KcpEngine::new(1);
        a.set_nodelay_params(params);
        assert_eq!(a.nodelay, nodelay);
        assert_eq!(a.interval, interval);
        assert_eq!(a.fast_resend, fast_resend);
        assert_eq!(a.nocwnd, nocwnd);
        assert_eq!(a.rx_minrto, minrto);
    }

    #[test]
    fn test_rtt_estimate() {
        let mut a = KcpEngine::new(1);
        a.update_ack(40);
        assert_eq!(a.rx_srtt, 40);
        assert_eq!(a.rx_rttval, 20);
        // 40 + max(100, 80), above min rto
        assert_eq!(a.rto(), 140);

        a.update_ack(80);
        assert_eq!(a.rx_srtt, 45);
        assert_eq!(a.rx_rttval, 25);
        assert_eq!(a.rto(), 145);
    }

    #[test]
    fn test_with_config() {
        let config = KcpConfig {
            mtu: 500,
            ..KcpConfig::fastest()
        };
        let a = KcpEngine::with_config(1, &config, Arc::new(HeapAllocator)).unwrap();
        assert_eq!(a.mtu(), 500);
        assert_eq!(a.mss(), 476);
        assert!(a.nodelay);
        assert!(a.nocwnd);
        assert_eq!(a.interval, 10);

        assert!(KcpEngine::with_config(1, &KcpConfig { mtu: 10, ..KcpConfig::default() }, Arc::new(HeapAllocator)).is_err());
    }

    #[test]
    fn test_buffers_returned_to_pool() {
        let pool = Arc::new(BufferPool::new(1376, 16));
        let mut a = KcpEngine::with_allocator(1, pool.clone());
        let mut b = KcpEngine::with_allocator(1, pool.clone());

        a.send(b"pooled").unwrap();
        for f in flush(&mut a) {
            b.input(&f).unwrap();
        }
        assert_eq!(receive_all(&mut b), vec![b"pooled".to_vec()]);
        assert_eq!(pool.num_pooled(), 1);

        drop(a);
        assert_eq!(pool.num_pooled(), 2);
    }
}
