//! Asynchronous (interrupt-driven) read dispatch.
//!
//! A hardware interrupt is identified by a dotted path of small
//! integers (controller, line, sub-line, ...). Each subscriber gets its
//! own bounded queue; a backend's interrupt service routine pushes a
//! [`VersionNumber`] into every queue subscribed under the fired id, and
//! a blocking `read_transfer` on the async element pops from its queue.
//! This is the backend -> accessor direction; the reverse (accessor
//! keeping the backend alive) is the ordinary `Arc<dyn Backend>` strong
//! reference every accessor already holds, so this dispatcher only
//! needs a weak link back, never owning the backend.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::backend::numeric_addressed::RawDevice;
use crate::error::{DeviceError, Result};
use crate::version::VersionNumber;

/// Identifies one interrupt source: e.g. `[0, 3]` for controller 0,
/// line 3.
pub type InterruptId = Vec<u32>;

/// How a controller node enables interrupt delivery. Independent of
/// [`AcknowledgeVariant`] — a node may declare at most one of each, but
/// the two choices are orthogonal (e.g. SIE/CIE enable alongside an ISR
/// acknowledge is a legal combination).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableVariant {
    /// Write `1<<bit` to SIE to subscribe, `1<<bit` to CIE to
    /// unsubscribe.
    SieCie,
    /// A master enable register (MER/GIE/MIE) gating the whole
    /// controller: set on first subscription, cleared on teardown.
    MerGieMie,
}

/// How a controller node acknowledges a fired line so it can fire
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeVariant {
    /// Read ISR to find the source, write `1<<bit` back to ISR.
    Isr,
    /// Same, but the acknowledge write goes to IAR; ISR retains the raw
    /// latch.
    Iar,
    /// Same, but the acknowledge write goes to ICR.
    Icr,
}

/// The named raw registers one controller node's handshake may touch.
/// Which fields are required depends on the node's declared
/// [`EnableVariant`]/[`AcknowledgeVariant`]; see [`ControllerNode::validate`].
#[derive(Debug, Clone, Default)]
pub struct HandshakeRegisters {
    pub isr: Option<String>,
    pub ier: Option<String>,
    pub iar: Option<String>,
    pub icr: Option<String>,
    pub sie: Option<String>,
    pub cie: Option<String>,
    pub mer: Option<String>,
}

/// One interrupt-controller node's declared handshake. `enable` and
/// `acknowledge` are each a single `Option`, so "at most one enable
/// variant, at most one acknowledge variant" is structural rather than
/// a runtime check.
#[derive(Debug, Clone)]
pub struct ControllerNode {
    pub bit: u32,
    pub enable: Option<EnableVariant>,
    pub acknowledge: Option<AcknowledgeVariant>,
    pub registers: HandshakeRegisters,
}

impl ControllerNode {
    /// Checks that the registers required by the declared enable/
    /// acknowledge variants are actually present.
    pub fn validate(&self, path: &str) -> Result<()> {
        match self.enable {
            Some(EnableVariant::SieCie) if self.registers.sie.is_none() || self.registers.cie.is_none() => {
                return Err(DeviceError::logic(path, "SIE/CIE enable needs both a sie and a cie register"));
            }
            Some(EnableVariant::MerGieMie) if self.registers.mer.is_none() => {
                return Err(DeviceError::logic(path, "MER/GIE/MIE enable needs an mer register"));
            }
            _ => {}
        }
        match self.acknowledge {
            Some(AcknowledgeVariant::Isr) if self.registers.isr.is_none() => {
                return Err(DeviceError::logic(path, "ISR acknowledge needs an isr register"));
            }
            Some(AcknowledgeVariant::Iar) if self.registers.isr.is_none() || self.registers.iar.is_none() => {
                return Err(DeviceError::logic(path, "IAR acknowledge needs both an isr and an iar register"));
            }
            Some(AcknowledgeVariant::Icr) if self.registers.icr.is_none() => {
                return Err(DeviceError::logic(path, "ICR acknowledge needs an icr register"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// The interrupt-controller tree (flattened to a map keyed by
/// interrupt path, since the "tree" structure is just the shared
/// prefixes of those paths): each declared node's handshake
/// configuration, looked up by a backend at `activate_async_read` time
/// and by a firing leaf at acknowledge time.
#[derive(Debug, Default)]
pub struct ControllerTree {
    nodes: Mutex<HashMap<InterruptId, ControllerNode>>,
}

impl ControllerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, id: InterruptId, node: ControllerNode) -> Result<()> {
        node.validate(&format!("{id:?}"))?;
        self.nodes.lock().insert(id, node);
        Ok(())
    }

    pub fn get(&self, id: &InterruptId) -> Option<ControllerNode> {
        self.nodes.lock().get(id).cloned()
    }
}

struct Subscriber {
    sender: Sender<VersionNumber>,
    receiver: Receiver<VersionNumber>,
}

/// Per-subscriber bounded (depth 3) queues keyed by interrupt id, plus
/// the poisoned flag every queue consults before blocking.
#[derive(Default)]
pub struct InterruptDispatcher {
    subscribers: Mutex<HashMap<InterruptId, Vec<Subscriber>>>,
    poisoned: Mutex<Option<String>>,
}

impl std::fmt::Debug for InterruptDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptDispatcher")
            .field("n_ids", &self.subscribers.lock().len())
            .finish()
    }
}

const QUEUE_DEPTH: usize = 3;

impl InterruptDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for `id`, returning the receiving end
    /// of its queue.
    pub fn subscribe(&self, id: InterruptId) -> Receiver<VersionNumber> {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        self.subscribers
            .lock()
            .entry(id)
            .or_default()
            .push(Subscriber {
                sender: tx,
                receiver: rx.clone(),
            });
        rx
    }

    /// Called from a backend's interrupt service routine: pushes a
    /// fresh version into every queue subscribed under `id`. A full
    /// queue drops its oldest entry first, matching "keep only the
    /// newest when the consumer falls behind."
    pub fn dispatch(&self, id: &InterruptId, version: VersionNumber) {
        let subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get(id) {
            for sub in list {
                if let Err(TrySendError::Full(_)) = sub.sender.try_send(version) {
                    let _ = sub.receiver.try_recv();
                    let _ = sub.sender.try_send(version);
                }
            }
        }
    }

    /// The ids with at least one live subscriber, in no particular
    /// order. Used by a backend's `activate_async_read` to know which
    /// controller nodes need their enable registers written.
    pub fn subscribed_ids(&self) -> Vec<InterruptId> {
        self.subscribers.lock().keys().cloned().collect()
    }

    /// Removes the subscriber holding `receiver` from `id`'s list.
    /// Returns `true` if that was the last subscriber for `id` (the
    /// caller should then disable hardware delivery for it), `false` if
    /// others remain or `id` was already gone.
    pub fn unsubscribe(&self, id: &InterruptId, receiver: &Receiver<VersionNumber>) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(id) else {
            return false;
        };
        list.retain(|sub| !sub.receiver.same_channel(receiver));
        if list.is_empty() {
            subscribers.remove(id);
            true
        } else {
            false
        }
    }

    /// Pushes an initial value into every registered id's queues, per
    /// the "activate_async_read" contract: called once after `open()`,
    /// never before. Writing the hardware enable registers themselves
    /// is the backend's job (it knows the controller tree); this only
    /// performs the software-side initial delivery.
    pub fn activate(&self, _device: &dyn RawDevice) -> Result<()> {
        for id in self.subscribed_ids() {
            self.dispatch(&id, VersionNumber::new());
        }
        Ok(())
    }

    /// Poisons every subscriber queue: the next blocking receive on any
    /// of them fails with a runtime error instead of hanging forever.
    pub fn poison_all(&self, message: &str) {
        *self.poisoned.lock() = Some(message.to_string());
    }

    pub fn clear_poison(&self) {
        *self.poisoned.lock() = None;
    }

    pub fn check_poisoned(&self, path: &str) -> Result<()> {
        match &*self.poisoned.lock() {
            Some(message) => Err(DeviceError::runtime(path, message.clone())),
            None => Ok(()),
        }
    }
}

/// Blocking receive used by an async transfer element's `read_transfer`:
/// waits for the next version, failing immediately if the dispatcher
/// has been poisoned by [`InterruptDispatcher::poison_all`].
pub fn recv_blocking(
    dispatcher: &InterruptDispatcher,
    receiver: &Receiver<VersionNumber>,
    path: &str,
) -> Result<VersionNumber> {
    dispatcher.check_poisoned(path)?;
    receiver
        .recv()
        .map_err(|_| DeviceError::runtime(path, "interrupt queue disconnected"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_wakes_subscriber() {
        let dispatcher = Arc::new(InterruptDispatcher::new());
        let rx = dispatcher.subscribe(vec![0, 1]);
        dispatcher.dispatch(&vec![0, 1], VersionNumber::new());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let dispatcher = InterruptDispatcher::new();
        let rx = dispatcher.subscribe(vec![0]);
        for _ in 0..(QUEUE_DEPTH + 2) {
            dispatcher.dispatch(&vec![0], VersionNumber::new());
        }
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, QUEUE_DEPTH);
    }

    #[test]
    fn poison_fails_blocking_receive() {
        let dispatcher = InterruptDispatcher::new();
        let rx = dispatcher.subscribe(vec![0]);
        dispatcher.poison_all("cable unplugged");
        let err = recv_blocking(&dispatcher, &rx, "/x").unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn unsubscribe_drops_dead_receiver_and_reports_when_last() {
        let dispatcher = InterruptDispatcher::new();
        let rx_a = dispatcher.subscribe(vec![0]);
        let rx_b = dispatcher.subscribe(vec![0]);

        assert!(!dispatcher.unsubscribe(&vec![0], &rx_a));
        assert_eq!(dispatcher.subscribed_ids(), vec![vec![0]]);

        assert!(dispatcher.unsubscribe(&vec![0], &rx_b));
        assert!(dispatcher.subscribed_ids().is_empty());
    }

    #[test]
    fn subscribed_ids_reflects_live_subscriptions() {
        let dispatcher = InterruptDispatcher::new();
        dispatcher.subscribe(vec![0, 4]);
        dispatcher.subscribe(vec![1]);
        let mut ids = dispatcher.subscribed_ids();
        ids.sort();
        assert_eq!(ids, vec![vec![0, 4], vec![1]]);
    }

    #[test]
    fn isr_acknowledge_node_validates_with_an_isr_register() {
        let node = ControllerNode {
            bit: 4,
            enable: Some(EnableVariant::MerGieMie),
            acknowledge: Some(AcknowledgeVariant::Isr),
            registers: HandshakeRegisters {
                isr: Some("ISR".to_string()),
                mer: Some("MER".to_string()),
                ..Default::default()
            },
        };
        node.validate("!0:4").unwrap();
    }

    #[test]
    fn isr_acknowledge_node_without_isr_register_is_a_logic_error() {
        let node = ControllerNode {
            bit: 4,
            enable: None,
            acknowledge: Some(AcknowledgeVariant::Isr),
            registers: HandshakeRegisters::default(),
        };
        assert!(node.validate("!0:4").unwrap_err().is_logic());
    }

    #[test]
    fn sie_cie_enable_without_cie_register_is_a_logic_error() {
        let node = ControllerNode {
            bit: 0,
            enable: Some(EnableVariant::SieCie),
            acknowledge: None,
            registers: HandshakeRegisters {
                sie: Some("SIE".to_string()),
                ..Default::default()
            },
        };
        assert!(node.validate("!0").unwrap_err().is_logic());
    }

    #[test]
    fn controller_tree_configure_and_get() {
        let tree = ControllerTree::new();
        let node = ControllerNode {
            bit: 4,
            enable: Some(EnableVariant::MerGieMie),
            acknowledge: Some(AcknowledgeVariant::Isr),
            registers: HandshakeRegisters {
                isr: Some("ISR".to_string()),
                mer: Some("MER".to_string()),
                ..Default::default()
            },
        };
        tree.configure(vec![0, 4], node).unwrap();
        assert!(tree.get(&vec![0, 4]).is_some());
        assert!(tree.get(&vec![9]).is_none());
    }
}
