// nfc-rw-rs/nfc-rw/src/session.rs
//! Reader/writer session: owns the control block of the active tag and
//! routes transport events to it.
//!
//! The session itself holds no protocol logic. Engines queue their events
//! on the [`Link`]; the session hands them to the callback once the engine
//! handler has returned.

use crate::config::RwConfig;
use crate::events::RwEvent;
use crate::protocol::retry::Link;
use crate::stats::RwStats;
use crate::tags::{I93Engine, NdefSizes, T1tEngine, T2tEngine, TagEngine};
use crate::transport::Transport;
use crate::types::{HeaderRom, I93Uid, Protocol, T1tUid};
use crate::{Error, Result};

/// Upper-layer event sink, kept for the lifetime of one activation.
pub type EventCallback = Box<dyn FnMut(RwEvent)>;

/// Activation data reported by the poll that found the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivationParams {
    /// Header ROM and first four UID bytes from RID
    Type1 {
        /// HR0, HR1
        hr: [u8; 2],
        /// UID0..UID3
        uid: [u8; 4],
    },
    /// First UID byte (manufacturer)
    Type2 {
        /// NFCID1 byte 0
        manufacturer_id: u8,
    },
    /// UID in printed order (`E0` first)
    Iso15693 {
        /// UID, MSB first
        uid: [u8; 8],
        /// DSFID from the inventory response
        dsfid: u8,
    },
    /// Type 3 tag; selecting it is refused
    Type3,
    /// Type 4 tag; selecting it is refused
    Type4,
}

impl ActivationParams {
    /// Protocol family of the parameters.
    pub fn protocol(&self) -> Protocol {
        match self {
            ActivationParams::Type1 { .. } => Protocol::Type1,
            ActivationParams::Type2 { .. } => Protocol::Type2,
            ActivationParams::Iso15693 { .. } => Protocol::Iso15693,
            ActivationParams::Type3 => Protocol::Type3,
            ActivationParams::Type4 => Protocol::Type4,
        }
    }
}

/// Per-family state of the activated tag.
#[derive(Debug)]
pub enum TagControlBlock {
    /// Type 1 engine
    Type1(T1tEngine),
    /// Type 2 engine
    Type2(T2tEngine),
    /// ISO 15693 engine
    Iso15693(I93Engine),
}

impl TagControlBlock {
    fn activate(params: ActivationParams, config: &RwConfig) -> Result<Self> {
        match params {
            ActivationParams::Type1 { hr, uid } => Ok(TagControlBlock::Type1(T1tEngine::new(
                HeaderRom::new(hr[0], hr[1]),
                T1tUid::from_bytes(uid),
            ))),
            ActivationParams::Type2 { manufacturer_id } => {
                if config.t2t_model(manufacturer_id, None).is_none() {
                    log::warn!(
                        "no T2T model for manufacturer {:#04x}; formatting will be rejected",
                        manufacturer_id
                    );
                }
                Ok(TagControlBlock::Type2(T2tEngine::new()))
            }
            ActivationParams::Iso15693 { uid, dsfid } => Ok(TagControlBlock::Iso15693(I93Engine::new(
                I93Uid::from_bytes(uid),
                dsfid,
            ))),
            ActivationParams::Type3 | ActivationParams::Type4 => {
                Err(Error::UnsupportedProtocol(params.protocol()))
            }
        }
    }

    /// The engine behind the uniform NDEF operations.
    pub fn engine(&self) -> &dyn TagEngine {
        match self {
            TagControlBlock::Type1(e) => e,
            TagControlBlock::Type2(e) => e,
            TagControlBlock::Iso15693(e) => e,
        }
    }

    /// Mutable access to the engine.
    pub fn engine_mut(&mut self) -> &mut dyn TagEngine {
        match self {
            TagControlBlock::Type1(e) => e,
            TagControlBlock::Type2(e) => e,
            TagControlBlock::Iso15693(e) => e,
        }
    }

    /// Protocol of the active engine.
    pub fn protocol(&self) -> Protocol {
        self.engine().protocol()
    }
}

/// Single-tag reader/writer session.
pub struct RwSession {
    link: Link,
    tcb: Option<TagControlBlock>,
    callback: Option<EventCallback>,
}

impl RwSession {
    /// Session with no tag selected.
    pub fn new(transport: Box<dyn Transport>, config: RwConfig) -> Self {
        Self {
            link: Link::new(transport, config),
            tcb: None,
            callback: None,
        }
    }

    /// Activate the engine for a freshly polled tag.
    ///
    /// Any previous activation is torn down first without further events.
    pub fn select(&mut self, params: ActivationParams, callback: Option<EventCallback>) -> Result<()> {
        let callback = callback.ok_or(Error::NoCallback)?;
        let tcb = TagControlBlock::activate(params, self.link.config())?;
        if let Some(old) = self.tcb.as_mut() {
            log::debug!("re-select: dropping {} control block", old.protocol());
            old.engine_mut().on_deactivate(&mut self.link);
            self.link.drain_events();
        }
        self.link.stats_mut().reset();
        log::info!("selected {}", tcb.protocol());
        self.tcb = Some(tcb);
        self.callback = Some(callback);
        Ok(())
    }

    /// Protocol of the selected tag, if any.
    pub fn protocol(&self) -> Option<Protocol> {
        self.tcb.as_ref().map(TagControlBlock::protocol)
    }

    /// Control block of the selected tag.
    pub fn control_block(&self) -> Option<&TagControlBlock> {
        self.tcb.as_ref()
    }

    /// True when a tag is selected and no operation is running.
    pub fn is_idle(&self) -> bool {
        self.tcb.as_ref().is_some_and(|t| t.engine().is_idle())
    }

    /// NDEF sizes found by the last detection.
    pub fn ndef_sizes(&self) -> Option<NdefSizes> {
        self.tcb.as_ref().map(|t| t.engine().ndef_sizes())
    }

    /// Link counters for the current activation.
    pub fn stats(&self) -> &RwStats {
        self.link.stats()
    }

    /// Active configuration.
    pub fn config(&self) -> &RwConfig {
        self.link.config()
    }

    /// Replace the configuration.
    pub fn set_config(&mut self, config: RwConfig) {
        self.link.set_config(config);
    }

    // ---- uniform NDEF operations ----------------------------------------

    /// Start NDEF detection. Ends with [`RwEvent::NdefDetect`].
    pub fn detect_ndef(&mut self) -> Result<()> {
        self.run(|engine, link| engine.detect_ndef(link))
    }

    /// Start reading the detected NDEF message.
    pub fn read_ndef(&mut self) -> Result<()> {
        self.run(|engine, link| engine.read_ndef(link))
    }

    /// Start writing `message` as the new NDEF message.
    pub fn write_ndef(&mut self, message: &[u8]) -> Result<()> {
        self.run(|engine, link| engine.write_ndef(link, message))
    }

    /// Start formatting the tag for NDEF.
    pub fn format_ndef(&mut self) -> Result<()> {
        self.run(|engine, link| engine.format_ndef(link))
    }

    /// Start making the tag read-only; `hard_lock` also sets the lock bits.
    pub fn set_tag_read_only(&mut self, hard_lock: bool) -> Result<()> {
        self.run(|engine, link| engine.set_tag_read_only(link, hard_lock))
    }

    /// Check that the tag is still in the field.
    pub fn presence_check(&mut self) -> Result<()> {
        self.run(|engine, link| engine.presence_check(link))
    }

    // ---- family-specific access -----------------------------------------

    /// Run `f` against the Type 1 engine.
    pub fn with_type1<R>(&mut self, f: impl FnOnce(&mut T1tEngine, &mut Link) -> Result<R>) -> Result<R> {
        let result = match self.tcb.as_mut() {
            Some(TagControlBlock::Type1(engine)) => f(engine, &mut self.link),
            Some(other) => Err(wrong_protocol(Protocol::Type1, other)),
            None => Err(Error::NotActivated),
        };
        self.dispatch_events();
        result
    }

    /// Run `f` against the Type 2 engine.
    pub fn with_type2<R>(&mut self, f: impl FnOnce(&mut T2tEngine, &mut Link) -> Result<R>) -> Result<R> {
        let result = match self.tcb.as_mut() {
            Some(TagControlBlock::Type2(engine)) => f(engine, &mut self.link),
            Some(other) => Err(wrong_protocol(Protocol::Type2, other)),
            None => Err(Error::NotActivated),
        };
        self.dispatch_events();
        result
    }

    /// Run `f` against the ISO 15693 engine.
    pub fn with_iso15693<R>(&mut self, f: impl FnOnce(&mut I93Engine, &mut Link) -> Result<R>) -> Result<R> {
        let result = match self.tcb.as_mut() {
            Some(TagControlBlock::Iso15693(engine)) => f(engine, &mut self.link),
            Some(other) => Err(wrong_protocol(Protocol::Iso15693, other)),
            None => Err(Error::NotActivated),
        };
        self.dispatch_events();
        result
    }

    // ---- inbound transport events ---------------------------------------

    /// Feed a response frame from the transport.
    pub fn on_response(&mut self, data: &[u8]) {
        self.route(|engine, link| engine.on_response(link, data));
    }

    /// The response timer expired.
    pub fn on_timeout(&mut self) {
        self.route(|engine, link| engine.on_timeout(link));
    }

    /// The transport reported error `code` for the outstanding frame.
    pub fn on_transport_error(&mut self, code: u8) {
        self.route(|engine, link| engine.on_transport_error(link, code));
    }

    /// The tag left the field. In-flight operations end silently.
    pub fn on_deactivate(&mut self) {
        let Some(tcb) = self.tcb.as_mut() else {
            log::debug!("deactivate without a selected tag");
            return;
        };
        log::info!("{} deactivated", tcb.protocol());
        tcb.engine_mut().on_deactivate(&mut self.link);
        let dropped = self.link.drain_events();
        if !dropped.is_empty() {
            log::debug!("{} event(s) dropped on deactivation", dropped.len());
        }
        self.link.stats().log();
    }

    fn run(&mut self, f: impl FnOnce(&mut dyn TagEngine, &mut Link) -> Result<()>) -> Result<()> {
        let result = match self.tcb.as_mut() {
            Some(tcb) => f(tcb.engine_mut(), &mut self.link),
            None => Err(Error::NotActivated),
        };
        self.dispatch_events();
        result
    }

    fn route(&mut self, f: impl FnOnce(&mut dyn TagEngine, &mut Link)) {
        match self.tcb.as_mut() {
            Some(tcb) => f(tcb.engine_mut(), &mut self.link),
            None => {
                log::debug!("inbound event without a selected tag");
                return;
            }
        }
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        let events = self.link.drain_events();
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        for event in events {
            callback(event);
        }
    }
}

impl std::fmt::Debug for RwSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwSession")
            .field("protocol", &self.protocol())
            .field("link", &self.link)
            .finish()
    }
}

fn wrong_protocol(expected: Protocol, tcb: &TagControlBlock) -> Error {
    Error::WrongProtocol {
        expected,
        actual: tcb.protocol(),
    }
}
