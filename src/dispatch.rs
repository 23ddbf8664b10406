use crate::bank::RegisterSpace;
use crate::error::{EctoError, Result};
use crate::pdu::{Frame, Request, Response};
use crate::slave::{SlaveEntry, SlaveRegistry};
use parking_lot::RwLock;
use std::sync::Arc;

pub type ErrorHook = Arc<dyn Fn(&EctoError) + Send + Sync>;
/// Called with `(slave, request_pdu, response_pdu)`.
pub type RequestHook = Arc<dyn Fn(u8, &[u8], &[u8]) + Send + Sync>;

/// Observation hooks of one server. Installing a hook replaces the previous
/// one. Hooks are called without any lock held, so they may reinstall hooks.
#[derive(Default)]
pub struct ServerHooks {
    on_error: RwLock<Option<ErrorHook>>,
    on_request_handled: RwLock<Option<RequestHook>>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_error(&self, hook: impl Fn(&EctoError) + Send + Sync + 'static) {
        *self.on_error.write() = Some(Arc::new(hook));
    }

    pub fn set_on_request_handled(&self, hook: impl Fn(u8, &[u8], &[u8]) + Send + Sync + 'static) {
        *self.on_request_handled.write() = Some(Arc::new(hook));
    }

    pub fn clear(&self) {
        *self.on_error.write() = None;
        *self.on_request_handled.write() = None;
    }

    pub fn error(&self, error: &EctoError) {
        let hook = self.on_error.read().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }

    pub fn request_handled(&self, slave: u8, request: &[u8], response: &[u8]) {
        let hook = self.on_request_handled.read().clone();
        if let Some(hook) = hook {
            hook(slave, request, response);
        }
    }
}

/// Turns candidate frames into response frames.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SlaveRegistry>,
    hooks: Arc<ServerHooks>,
    error_on_missing_slave: bool,
    broadcast_enable: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        hooks: Arc<ServerHooks>,
        error_on_missing_slave: bool,
        broadcast_enable: bool,
    ) -> Self {
        Self {
            registry,
            hooks,
            error_on_missing_slave,
            broadcast_enable,
        }
    }

    /// Handle one candidate frame. Returns the bytes to send back, if any.
    pub fn dispatch(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let frame = match Frame::deserialize(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(len = raw.len(), "Dropping frame: {}", e);
                self.hooks.error(&e);
                return None;
            }
        };

        if frame.is_broadcast() && self.broadcast_enable {
            self.broadcast(&frame);
            return None;
        }

        let Some(entry) = self.registry.get(frame.address) else {
            if self.error_on_missing_slave {
                self.hooks.error(&EctoError::UnknownSlave(frame.address));
            } else {
                tracing::trace!(slave = frame.address, "Ignoring frame for another slave");
            }
            return None;
        };

        let response = match execute(&entry, &frame.pdu) {
            Ok(response) => response,
            Err(e) => {
                let function = frame.function_code();
                let code = e.exception_code();
                tracing::debug!(
                    slave = frame.address,
                    function,
                    "Answering with exception: {}",
                    e
                );
                self.hooks.error(&EctoError::Exception {
                    slave: frame.address,
                    function,
                    code,
                });
                Response::exception(function, code)
            }
        };

        let response_pdu = response.encode();
        if !response.is_exception() {
            self.hooks
                .request_handled(frame.address, &frame.pdu, &response_pdu);
        }
        Some(Frame::new(frame.address, response_pdu).serialize())
    }

    /// Writes go to every slave whose bank accepts the range. Nothing is
    /// answered and no request hook fires.
    fn broadcast(&self, frame: &Frame) {
        let (start, values) = match Request::parse(&frame.pdu) {
            Ok(Request::WriteMultipleRegisters { start, values }) => (start, values),
            Ok(request) => {
                tracing::debug!(
                    function = request.function_code() as u8,
                    "Ignoring broadcast read"
                );
                return;
            }
            Err(e) => {
                tracing::debug!("Ignoring malformed broadcast: {}", e);
                return;
            }
        };

        for entry in self.registry.entries() {
            if let Err(e) = write_holding(&entry, start, &values) {
                tracing::trace!(
                    slave = entry.handle.address(),
                    "Broadcast write skipped: {}",
                    e
                );
            }
        }
    }
}

fn execute(entry: &SlaveEntry, pdu: &[u8]) -> Result<Response> {
    let request = Request::parse(pdu)?;
    match request {
        Request::ReadHoldingRegisters { start, count }
        | Request::ReadInputRegisters { start, count } => {
            let values = entry.handle.read(request.space(), start, count)?;
            Ok(Response::ReadRegisters {
                function: request.function_code(),
                values,
            })
        }
        Request::WriteMultipleRegisters { start, values } => {
            write_holding(entry, start, &values)?;
            Ok(Response::WriteMultipleRegisters {
                start,
                count: values.len() as u16,
            })
        }
    }
}

/// Slaves with a device are written through the device.
fn write_holding(entry: &SlaveEntry, start: u16, values: &[u16]) -> Result<()> {
    match &entry.device {
        Some(device) => device.apply_master_write(start, values),
        None => entry.handle.write(RegisterSpace::Holding, start, values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind};
    use parking_lot::Mutex;

    fn request(address: u8, request: Request) -> Vec<u8> {
        Frame::new(address, request.encode()).serialize()
    }

    fn setup(error_on_missing_slave: bool) -> (Dispatcher, Arc<SlaveRegistry>, Arc<ServerHooks>) {
        let registry = Arc::new(SlaveRegistry::new());
        let hooks = Arc::new(ServerHooks::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&hooks),
            error_on_missing_slave,
            true,
        );
        (dispatcher, registry, hooks)
    }

    fn error_log(hooks: &ServerHooks) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        hooks.set_on_error(move |e| sink.lock().push(e.to_string()));
        log
    }

    #[test]
    fn read_holding_registers() {
        let (dispatcher, registry, _) = setup(false);
        let slave = registry.add_slave(1).unwrap();
        slave.add_block(RegisterSpace::Holding, 0, 2).unwrap();
        slave.set_values(RegisterSpace::Holding, 0, &[0x1234, 0x5678]).unwrap();

        let response = dispatcher
            .dispatch(&request(1, Request::ReadHoldingRegisters { start: 0, count: 2 }))
            .unwrap();
        let frame = Frame::deserialize(&response).unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.pdu, vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn unknown_slave_is_silent() {
        let (dispatcher, _, hooks) = setup(false);
        let errors = error_log(&hooks);
        let response =
            dispatcher.dispatch(&request(9, Request::ReadHoldingRegisters { start: 0, count: 1 }));
        assert!(response.is_none());
        assert!(errors.lock().is_empty());
    }

    #[test]
    fn unknown_slave_reports_when_asked() {
        let (dispatcher, _, hooks) = setup(true);
        let errors = error_log(&hooks);
        assert!(dispatcher
            .dispatch(&request(9, Request::ReadHoldingRegisters { start: 0, count: 1 }))
            .is_none());
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("Unknown slave"));
    }

    #[test]
    fn read_past_block_is_illegal_address() {
        let (dispatcher, registry, hooks) = setup(false);
        let errors = error_log(&hooks);
        registry
            .add_slave(4)
            .unwrap()
            .add_block(RegisterSpace::Holding, 0, 4)
            .unwrap();

        let response = dispatcher
            .dispatch(&request(4, Request::ReadHoldingRegisters { start: 0, count: 5 }))
            .unwrap();
        assert_eq!(
            response,
            Frame::new(4, vec![0x83, 0x02]).serialize()
        );
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn write_single_register_is_illegal_function() {
        let (dispatcher, registry, _) = setup(false);
        registry.add_slave(4).unwrap();
        let raw = Frame::new(4, vec![0x06, 0x00, 0x10, 0x00, 0x01]).serialize();
        let response = Frame::deserialize(&dispatcher.dispatch(&raw).unwrap()).unwrap();
        assert_eq!(response.pdu, vec![0x86, 0x01]);
    }

    #[test]
    fn bad_quantity_is_illegal_data_value() {
        let (dispatcher, registry, _) = setup(false);
        registry.add_slave(4).unwrap();
        let raw = Frame::new(4, vec![0x04, 0x00, 0x00, 0x00, 0x00]).serialize();
        let response = Frame::deserialize(&dispatcher.dispatch(&raw).unwrap()).unwrap();
        assert_eq!(response.pdu, vec![0x84, 0x03]);
    }

    #[test]
    fn corrupt_frame_is_dropped_and_reported() {
        let (dispatcher, registry, hooks) = setup(false);
        let errors = error_log(&hooks);
        registry.add_slave(1).unwrap();
        let mut raw = request(1, Request::ReadHoldingRegisters { start: 0, count: 1 });
        raw[3] ^= 0x01;
        assert!(dispatcher.dispatch(&raw).is_none());
        assert!(errors.lock()[0].starts_with("CRC mismatch"));
    }

    #[test]
    fn write_syncs_device_before_request_hook() {
        let (dispatcher, registry, hooks) = setup(false);
        let slave = registry.add_slave(5).unwrap();
        let relay = Arc::new(
            Device::new(slave, DeviceKind::Relay, DeviceKind::Relay.default_profile()).unwrap(),
        );
        registry.attach_device(Arc::clone(&relay)).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        relay.set_state_change_callback(move |channel, on| {
            sink.lock().push(format!("channel {channel} {on}"))
        });
        let sink = Arc::clone(&events);
        let observed = Arc::downgrade(&relay);
        hooks.set_on_request_handled(move |slave, request, response| {
            let state = observed.upgrade().and_then(|r| r.get_channel_state(0));
            sink.lock().push(format!(
                "request {slave} {:02X?} {:02X?} {:?}",
                request, response, state
            ));
        });

        let raw = request(
            5,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x8000],
            },
        );
        let response = Frame::deserialize(&dispatcher.dispatch(&raw).unwrap()).unwrap();
        assert_eq!(response.pdu, vec![0x10, 0x00, 0x10, 0x00, 0x01]);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "channel 0 true");
        assert_eq!(
            events[1],
            "request 5 [10, 00, 10, 00, 01, 02, 80, 00] [10, 00, 10, 00, 01] Some(true)"
        );
    }

    #[test]
    fn master_writes_and_local_switches_do_not_interleave() {
        let (dispatcher, registry, _) = setup(false);
        let slave = registry.add_slave(5).unwrap();
        let relay = Arc::new(
            Device::new(slave, DeviceKind::Relay, DeviceKind::Relay.default_profile()).unwrap(),
        );
        registry.attach_device(Arc::clone(&relay)).unwrap();

        let on = request(
            5,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x8000],
            },
        );
        let off = request(
            5,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x0000],
            },
        );
        let broadcast = request(
            0,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x8000],
            },
        );

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..1000 {
                    let raw = match round % 3 {
                        0 => &on,
                        1 => &broadcast,
                        _ => &off,
                    };
                    dispatcher.dispatch(raw);
                }
            });
            scope.spawn(|| {
                for round in 0..1000 {
                    relay.set_switch_state(1, round % 2 == 0).unwrap();
                }
            });
        });

        let word = relay
            .slave()
            .read(RegisterSpace::Holding, 0x10, 1)
            .unwrap()[0];
        let states = relay.channel_states();
        assert_eq!(crate::device::channels::ChannelWord::from_states(&states).bits(), word);
    }

    #[test]
    fn broadcast_writes_everyone_and_answers_nobody() {
        let (dispatcher, registry, hooks) = setup(false);
        let handled = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&handled);
        hooks.set_on_request_handled(move |_, _, _| *counter.lock() += 1);

        let a = registry.add_slave(3).unwrap();
        let b = registry.add_slave(4).unwrap();
        let c = registry.add_slave(6).unwrap();
        a.add_block(RegisterSpace::Holding, 0x10, 1).unwrap();
        b.add_block(RegisterSpace::Holding, 0x10, 1).unwrap();
        c.add_block(RegisterSpace::Holding, 0x40, 1).unwrap();

        let raw = request(
            0,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![0x00AA],
            },
        );
        assert!(dispatcher.dispatch(&raw).is_none());
        assert_eq!(a.read(RegisterSpace::Holding, 0x10, 1).unwrap(), vec![0x00AA]);
        assert_eq!(b.read(RegisterSpace::Holding, 0x10, 1).unwrap(), vec![0x00AA]);
        assert_eq!(c.revision(), 0);
        assert_eq!(*handled.lock(), 0);
    }

    #[test]
    fn disabled_broadcast_is_an_unknown_slave() {
        let registry = Arc::new(SlaveRegistry::new());
        let hooks = Arc::new(ServerHooks::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&hooks), true, false);
        let errors = error_log(&hooks);
        let slave = registry.add_slave(3).unwrap();
        slave.add_block(RegisterSpace::Holding, 0x10, 1).unwrap();

        let raw = request(
            0,
            Request::WriteMultipleRegisters {
                start: 0x10,
                values: vec![1],
            },
        );
        assert!(dispatcher.dispatch(&raw).is_none());
        assert_eq!(slave.revision(), 0);
        assert_eq!(*errors.lock(), vec!["Unknown slave 0x00".to_string()]);
    }

    #[test]
    fn hook_replacement() {
        let hooks = ServerHooks::new();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&first);
        hooks.set_on_error(move |_| *sink.lock() += 1);
        let sink = Arc::clone(&second);
        hooks.set_on_error(move |_| *sink.lock() += 1);
        hooks.error(&EctoError::InvalidData);
        assert_eq!((*first.lock(), *second.lock()), (0, 1));
    }
}
