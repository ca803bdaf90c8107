use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, trace};
use crate::buffers::HeapAllocator;
use crate::config::{KcpConfig, NodelayParams};
use crate::engine::kcp::KcpEngine;
use crate::engine::ArqEngine;
use crate::packet::Packet;

/// Controls how many packets a session in async mode hands to its receive callback per `input()`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// At most one packet is dispatched per `input()` call, even if the frame completed several.
    ///  Remaining packets stay receivable via `receive()` or are dispatched by later inputs.
    #[default]
    OnePerInput,
    /// Every packet that is available after an `input()` call is dispatched
    DrainAll,
}

/// Programming errors in the way a session is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// `update()` or `flush()` was called before `set_output_function()`
    OutputFunctionNotSet,
    /// `input()` was called in async mode before `set_receive_callback()`
    ReceiveCallbackNotSet,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::OutputFunctionNotSet => write!(f, "no output function set: frames cannot be emitted"),
            SessionError::ReceiveCallbackNotSet => write!(f, "async mode without receive callback: packets cannot be dispatched"),
        }
    }
}

impl std::error::Error for SessionError {}


/// One end of a reliable, ordered packet conversation on top of an unreliable datagram transport.
///
/// The session never touches a socket. The application feeds raw frames it received into
///  [Session::input] and transmits the frames the session hands to its *output function*. Both
///  peers must use the same conversation id.
///
/// Packets become available in order. In sync mode (the default) they stay queued until the
///  application calls [Session::receive]; in async mode `input()` hands them to the receive
///  callback before it returns, according to the [DispatchPolicy].
///
/// Timer-driven work (retransmission, acknowledgements, flushing staged packets) happens in
///  [Session::update], which must be called regularly, ideally at the time returned by
///  [Session::when_to_update].
///
/// All calls are synchronous, and callbacks run on the caller's stack. A session is confined to
///  the thread that created it: the stored callbacks are not `Send`, and neither is the session.
pub struct Session<E: ArqEngine = KcpEngine> {
    engine: E,
    output: Option<Box<dyn FnMut(&[u8])>>,
    receive_callback: Option<Box<dyn FnMut(Packet)>>,
    async_mode: bool,
    dispatch_policy: DispatchPolicy,
}

impl Session<KcpEngine> {
    /// Creates a session with the engine's default configuration
    pub fn new(conv: u32) -> Session<KcpEngine> {
        Self::with_engine(KcpEngine::new(conv))
    }

    pub fn with_config(conv: u32, config: &KcpConfig) -> anyhow::Result<Session<KcpEngine>> {
        let engine = KcpEngine::with_config(conv, config, Arc::new(HeapAllocator))?;
        Ok(Self::with_engine(engine))
    }
}

impl Default for Session<KcpEngine> {
    /// conversation id 0 is the 'unset' id
    fn default() -> Self {
        Self::new(0)
    }
}

impl<E: ArqEngine> Session<E> {
    pub fn with_engine(engine: E) -> Session<E> {
        debug!("creating session for conversation {}", engine.conv());
        Session {
            engine,
            output: None,
            receive_callback: None,
            async_mode: false,
            dispatch_policy: DispatchPolicy::default(),
        }
    }

    pub fn conversation_id(&self) -> u32 {
        self.engine.conv()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Installs the function that transmits raw frames. It is called once per complete frame,
    ///  and replacing it takes effect with the next frame.
    pub fn set_output_function(&mut self, output: impl FnMut(&[u8]) + 'static) {
        self.output = Some(Box::new(output));
    }

    /// Switching to async mode does not dispatch packets that are already waiting to be received
    pub fn set_async_mode(&mut self, async_mode: bool) {
        self.async_mode = async_mode;
    }

    pub fn is_async_mode(&self) -> bool {
        self.async_mode
    }

    pub fn set_receive_callback(&mut self, callback: impl FnMut(Packet) + 'static) {
        self.receive_callback = Some(Box::new(callback));
    }

    pub fn set_dispatch_policy(&mut self, dispatch_policy: DispatchPolicy) {
        self.dispatch_policy = dispatch_policy;
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        self.dispatch_policy
    }

    pub fn set_mtu(&mut self, mtu: usize) -> anyhow::Result<()> {
        self.engine.set_mtu(mtu)?;
        Ok(())
    }

    pub fn set_max_send_window_size(&mut self, send_window: u16) {
        self.engine.set_window_sizes(Some(send_window), None);
    }

    pub fn set_max_receive_window_size(&mut self, receive_window: u16) {
        self.engine.set_window_sizes(None, Some(receive_window));
    }

    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.set_properties(NodelayParams { nodelay: Some(nodelay), ..NodelayParams::UNCHANGED });
    }

    pub fn set_internal_interval(&mut self, interval_millis: u32) {
        self.set_properties(NodelayParams { interval_millis: Some(interval_millis), ..NodelayParams::UNCHANGED });
    }

    pub fn set_fast_resend_threshold(&mut self, fast_resend: u32) {
        self.set_properties(NodelayParams { fast_resend: Some(fast_resend), ..NodelayParams::UNCHANGED });
    }

    pub fn set_congestion_control(&mut self, congestion_control: bool) {
        self.set_properties(NodelayParams { congestion_control: Some(congestion_control), ..NodelayParams::UNCHANGED });
    }

    /// Sets nodelay, interval, fast resend and congestion control in one go. `None` leaves a
    ///  parameter unchanged.
    pub fn set_properties(&mut self, params: NodelayParams) {
        self.engine.set_nodelay_params(params);
    }

    /// true once the engine gave up hope of getting a segment through. The session keeps working
    ///  regardless; it is up to the application to react.
    pub fn is_dead_link(&self) -> bool {
        self.engine.is_dead_link()
    }

    /// Feeds a raw frame received from the transport.
    ///
    /// In async mode, available packets are dispatched to the receive callback before this call
    ///  returns, even if the frame was only partially valid.
    pub fn input(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        if self.async_mode && self.receive_callback.is_none() {
            return Err(SessionError::ReceiveCallbackNotSet.into());
        }

        let result = self.engine.input(frame);
        if let Err(e) = &result {
            debug!("conversation {}: error processing frame of {} bytes: {}", self.engine.conv(), frame.len(), e);
        }

        if self.async_mode {
            self.dispatch();
        }

        result?;
        Ok(())
    }

    fn dispatch(&mut self) {
        match self.dispatch_policy {
            DispatchPolicy::OnePerInput => {
                if let Some(packet) = self.receive() {
                    self.invoke_receive_callback(packet);
                }
            }
            DispatchPolicy::DrainAll => {
                while let Some(packet) = self.receive() {
                    self.invoke_receive_callback(packet);
                }
            }
        }
    }

    fn invoke_receive_callback(&mut self, packet: Packet) {
        if let Some(callback) = self.receive_callback.as_mut() {
            trace!("dispatching packet of {} bytes", packet.len());
            callback(packet);
        }
    }

    pub fn has_receivable_packet(&self) -> bool {
        self.engine.peek_size().is_some()
    }

    /// Size of the next packet, 0 if there is none. Use [Session::has_receivable_packet] to tell
    ///  an empty packet from no packet.
    pub fn next_packet_size(&self) -> usize {
        self.engine.peek_size().unwrap_or(0)
    }

    /// Takes the next complete packet, if any.
    ///
    /// Panics if the engine does not deliver exactly the packet size it reported. That can only
    ///  happen if engine state is corrupted.
    pub fn receive(&mut self) -> Option<Packet> {
        let size = self.engine.peek_size()?;

        let mut buf = vec![0u8; size];
        let filled = match self.engine.recv(&mut buf) {
            Ok(filled) => filled,
            Err(e) => panic!("engine reported a packet of {} bytes but failed to deliver it: {}", size, e),
        };
        assert_eq!(filled, size, "engine delivered a packet of different size than it reported");

        Some(Packet::new(buf))
    }

    /// Stages a packet for transmission. This never emits frames: they are produced by the next
    ///  `update()` or `flush()`.
    pub fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.engine.send(data)?;
        Ok(())
    }

    /// Advances the session's clock to `now_millis` and does whatever is due: retransmissions,
    ///  acknowledgements and sending staged packets
    pub fn update(&mut self, now_millis: u32) -> anyhow::Result<()> {
        let output = self.output.as_mut()
            .ok_or(SessionError::OutputFunctionNotSet)?;
        self.engine.update(now_millis, &mut **output);
        Ok(())
    }

    /// Emits everything that can be sent right now without waiting for the next `update()`
    pub fn flush(&mut self) -> anyhow::Result<()> {
        let output = self.output.as_mut()
            .ok_or(SessionError::OutputFunctionNotSet)?;
        self.engine.flush(&mut **output);
        Ok(())
    }

    /// The timestamp at which `update()` should be called next
    pub fn when_to_update(&self, now_millis: u32) -> u32 {
        self.engine.check(now_millis)
    }

    /// Number of segments that are staged or in flight and not yet acknowledged. This is a
    ///  measure for backpressure.
    pub fn num_pending_packets(&self) -> usize {
        self.engine.wait_snd()
    }
}
