//! IRQ objects
//!
//! A fixed table of platform pins is set up at boot. Userspace binds an IRQ
//! object to a pin and submits waits against the object; an edge on the pin
//! broadcasts one completion to every parked waiter and masks the pin until
//! userspace acknowledges. Edges with nobody waiting are lost; nothing is
//! queued across submissions.

use core_types::KernelResult;
use std::sync::{Arc, Mutex, Weak};

use crate::writer::{Completer, EventWriter};

struct PinState {
    masked: bool,
    objects: Vec<Weak<IrqObject>>,
    /// Edges that arrived masked or unobserved (tests and diagnostics).
    dropped_edges: u64,
}

/// One platform interrupt pin.
pub struct IrqPin {
    number: u32,
    state: Mutex<PinState>,
}

impl IrqPin {
    pub fn new(number: u32) -> Arc<IrqPin> {
        Arc::new(IrqPin {
            number,
            state: Mutex::new(PinState {
                masked: false,
                objects: Vec::new(),
                dropped_edges: 0,
            }),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    fn attach(&self, object: &Arc<IrqObject>) {
        let mut state = self.state.lock().expect("irq pin lock");
        state.objects.push(Arc::downgrade(object));
    }

    /// A hardware edge. Returns the number of completions delivered.
    pub fn fire(&self) -> usize {
        let completers = {
            let mut state = self.state.lock().expect("irq pin lock");
            if state.masked {
                state.dropped_edges += 1;
                return 0;
            }
            let mut completers = Vec::new();
            state.objects.retain(|object| match object.upgrade() {
                Some(object) => {
                    completers.append(&mut object.take_waiters());
                    true
                }
                None => false,
            });
            if completers.is_empty() {
                state.dropped_edges += 1;
                return 0;
            }
            // Mask until the handler acknowledges, so a storming device
            // cannot re-enter.
            state.masked = true;
            completers
        };

        let delivered = completers.len();
        for completer in completers {
            completer.complete(EventWriter::ok());
        }
        delivered
    }

    fn unmask(&self) {
        let mut state = self.state.lock().expect("irq pin lock");
        state.masked = false;
    }

    pub fn is_masked(&self) -> bool {
        self.state.lock().expect("irq pin lock").masked
    }

    pub fn dropped_edges(&self) -> u64 {
        self.state.lock().expect("irq pin lock").dropped_edges
    }
}

/// Userspace's binding to a pin.
pub struct IrqObject {
    pin: Arc<IrqPin>,
    waiters: Mutex<Vec<Completer>>,
}

impl IrqObject {
    /// Binds a new object to the pin.
    pub fn bind(pin: Arc<IrqPin>) -> Arc<IrqObject> {
        let object = Arc::new(IrqObject {
            pin,
            waiters: Mutex::new(Vec::new()),
        });
        object.pin.attach(&object);
        object
    }

    /// Parks a wait; it completes on the next edge.
    pub fn submit_wait(&self, completer: Completer) -> KernelResult<()> {
        let mut waiters = self.waiters.lock().expect("irq object lock");
        waiters.push(completer);
        Ok(())
    }

    /// Re-arms the pin after the handler is done.
    pub fn acknowledge(&self) {
        self.pin.unmask();
    }

    fn take_waiters(&self) -> Vec<Completer> {
        let mut waiters = self.waiters.lock().expect("irq object lock");
        std::mem::take(&mut *waiters)
    }
}
