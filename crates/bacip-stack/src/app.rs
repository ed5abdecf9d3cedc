//! Application layer: local objects, service handler registries, and the
//! translation of handler outcomes onto the wire.

use crate::error::ServiceError;
use bacip_core::address::Address;
use bacip_core::apdu::{
    AbortPdu, Apdu, ComplexAck, ErrorPdu, RejectPdu, RejectReason, SimpleAck,
};
use bacip_core::object::ObjectId;
use bacip_core::services::{confirmed_service_bit, unconfirmed_service_bit};
use std::collections::HashMap;

/// A successful confirmed-service outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAck {
    /// Answer with a SimpleAck.
    Simple,
    /// Answer with a ComplexAck carrying this service payload.
    Complex(Vec<u8>),
}

/// Handler for one confirmed service choice. The payload is the raw service
/// data; decoding it is the handler's business.
pub trait ConfirmedHandler: Send {
    fn handle(&mut self, source: &Address, data: &[u8]) -> Result<ServiceAck, ServiceError>;
}

/// Handler for one unconfirmed service choice. There is no reply path;
/// failures stay local.
pub trait UnconfirmedHandler: Send {
    fn handle(&mut self, source: &Address, data: &[u8]);
}

impl<F> ConfirmedHandler for F
where
    F: FnMut(&Address, &[u8]) -> Result<ServiceAck, ServiceError> + Send,
{
    fn handle(&mut self, source: &Address, data: &[u8]) -> Result<ServiceAck, ServiceError> {
        self(source, data)
    }
}

impl<F> UnconfirmedHandler for F
where
    F: FnMut(&Address, &[u8]) + Send,
{
    fn handle(&mut self, source: &Address, data: &[u8]) {
        self(source, data)
    }
}

/// A locally hosted object. The stack tracks identity only; properties live
/// with the application's handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalObject {
    pub id: ObjectId,
    pub name: String,
}

/// Routes inbound APDUs to registered handlers and answers for the local
/// object collection.
pub struct ApplicationDispatcher {
    objects_by_id: HashMap<ObjectId, LocalObject>,
    objects_by_name: HashMap<String, ObjectId>,
    device_id: ObjectId,
    confirmed: HashMap<u8, Box<dyn ConfirmedHandler>>,
    unconfirmed: HashMap<u8, Box<dyn UnconfirmedHandler>>,
}

impl std::fmt::Debug for ApplicationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationDispatcher")
            .field("device_id", &self.device_id)
            .field("objects", &self.objects_by_id.len())
            .field("confirmed_services", &self.confirmed.len())
            .field("unconfirmed_services", &self.unconfirmed.len())
            .finish()
    }
}

impl ApplicationDispatcher {
    /// The device object itself is always registered.
    pub fn new(device: LocalObject) -> Self {
        let device_id = device.id;
        let mut objects_by_id = HashMap::new();
        let mut objects_by_name = HashMap::new();
        objects_by_name.insert(device.name.clone(), device.id);
        objects_by_id.insert(device.id, device);
        Self {
            objects_by_id,
            objects_by_name,
            device_id,
            confirmed: HashMap::new(),
            unconfirmed: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> ObjectId {
        self.device_id
    }

    pub fn add_object(&mut self, object: LocalObject) -> Result<(), ServiceError> {
        if object.id.instance() > ObjectId::MAX_INSTANCE
            || self.objects_by_id.contains_key(&object.id)
            || self.objects_by_name.contains_key(&object.name)
        {
            return Err(ServiceError::Execution {
                class: 1,  // object
                code: 126, // duplicate-name / duplicate-object-id family
            });
        }
        self.objects_by_name.insert(object.name.clone(), object.id);
        self.objects_by_id.insert(object.id, object);
        Ok(())
    }

    pub fn remove_object(&mut self, id: &ObjectId) -> Option<LocalObject> {
        let object = self.objects_by_id.remove(id)?;
        self.objects_by_name.remove(&object.name);
        Some(object)
    }

    pub fn object(&self, id: &ObjectId) -> Option<&LocalObject> {
        self.objects_by_id.get(id)
    }

    pub fn object_by_name(&self, name: &str) -> Option<&LocalObject> {
        self.objects_by_name
            .get(name)
            .and_then(|id| self.objects_by_id.get(id))
    }

    pub fn objects(&self) -> impl Iterator<Item = &LocalObject> {
        self.objects_by_id.values()
    }

    pub fn register_confirmed(&mut self, service_choice: u8, handler: Box<dyn ConfirmedHandler>) {
        self.confirmed.insert(service_choice, handler);
    }

    pub fn register_unconfirmed(
        &mut self,
        service_choice: u8,
        handler: Box<dyn UnconfirmedHandler>,
    ) {
        self.unconfirmed.insert(service_choice, handler);
    }

    /// The protocol-services-supported bit string, derived from the
    /// registered handlers. 48 bits, most significant bit first.
    pub fn services_supported(&self) -> [u8; 6] {
        let mut bits = [0u8; 6];
        let mut set = |bit: u8| {
            let byte = usize::from(bit / 8);
            if byte < bits.len() {
                bits[byte] |= 0x80 >> (bit % 8);
            }
        };
        for choice in self.confirmed.keys() {
            if let Some(bit) = confirmed_service_bit(*choice) {
                set(bit);
            }
        }
        for choice in self.unconfirmed.keys() {
            if let Some(bit) = unconfirmed_service_bit(*choice) {
                set(bit);
            }
        }
        bits
    }

    /// Run a confirmed request through its handler and shape the answer.
    pub fn handle_confirmed(
        &mut self,
        source: &Address,
        invoke_id: u8,
        service_choice: u8,
        data: &[u8],
    ) -> Apdu {
        let Some(handler) = self.confirmed.get_mut(&service_choice) else {
            return Apdu::Reject(RejectPdu {
                invoke_id,
                reason: RejectReason::UnrecognizedService as u8,
            });
        };
        match handler.handle(source, data) {
            Ok(ServiceAck::Simple) => Apdu::SimpleAck(SimpleAck {
                invoke_id,
                service_choice,
            }),
            Ok(ServiceAck::Complex(payload)) => Apdu::ComplexAck {
                header: ComplexAck::unsegmented(invoke_id, service_choice),
                data: payload,
            },
            Err(ServiceError::Reject(reason)) => Apdu::Reject(RejectPdu {
                invoke_id,
                reason: reason as u8,
            }),
            Err(ServiceError::Abort(reason)) => Apdu::Abort(AbortPdu {
                from_server: true,
                invoke_id,
                reason: reason as u8,
            }),
            Err(ServiceError::Execution { class, code }) => Apdu::Error(ErrorPdu {
                invoke_id,
                service_choice,
                error_class: class,
                error_code: code,
            }),
        }
    }

    /// Run an unconfirmed request; unknown services vanish without a trace.
    pub fn handle_unconfirmed(&mut self, source: &Address, service_choice: u8, data: &[u8]) {
        match self.unconfirmed.get_mut(&service_choice) {
            Some(handler) => handler.handle(source, data),
            None => log::debug!("no handler for unconfirmed service {service_choice}"),
        }
    }

    pub fn handles_confirmed(&self, service_choice: u8) -> bool {
        self.confirmed.contains_key(&service_choice)
    }
}
