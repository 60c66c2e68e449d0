//! Listener codecs.
//!
//! A [`ListenerCodec`] knows how to turn one kind of listener registration
//! into wire requests. The coordinator never looks inside the messages; it
//! only needs the three operations below.

use crate::error::{HzlinkError, Result};
use crate::protocol::{message_type, ClientMessage, PayloadReader, PayloadWriter};
use crate::registration::{DistributedObjectKey, ServerRegistrationId, UserRegistrationId};
use bytes::Bytes;
use std::fmt;

/// Status byte of a register response.
const STATUS_REGISTERED: u8 = 0;
const STATUS_ALREADY_REGISTERED: u8 = 1;

/// Decoded answer to a registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub server_registration_id: ServerRegistrationId,
    /// The member already held this registration. Treated exactly like a
    /// fresh registration by the coordinator.
    pub already_registered: bool,
}

/// Encoder/decoder capability for one listener type.
pub trait ListenerCodec: Send + Sync + fmt::Debug {
    /// Build the registration request. `local_only` is set by smart clients,
    /// which register on every member and want each member's local events only.
    fn encode_add_request(
        &self,
        key: &DistributedObjectKey,
        registration_id: &UserRegistrationId,
        local_only: bool,
    ) -> ClientMessage;

    fn decode_add_response(&self, response: ClientMessage) -> Result<RegisterResponse>;

    /// Build the deregistration request, or `None` when the registration has
    /// no remote counterpart to remove.
    fn encode_remove_request(
        &self,
        key: &DistributedObjectKey,
        handle: &ServerRegistrationId,
    ) -> Option<ClientMessage>;
}

/// Options of an entry listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryListenerOptions {
    /// Ship values with events.
    pub include_value: bool,
    /// Only deliver events for this key.
    pub key: Option<Bytes>,
}

/// Codec for map-style entry listeners.
#[derive(Debug, Clone, Default)]
pub struct EntryListenerCodec {
    options: EntryListenerOptions,
}

impl EntryListenerCodec {
    pub fn new(options: EntryListenerOptions) -> Self {
        Self { options }
    }
}

impl ListenerCodec for EntryListenerCodec {
    fn encode_add_request(
        &self,
        key: &DistributedObjectKey,
        registration_id: &UserRegistrationId,
        local_only: bool,
    ) -> ClientMessage {
        let mut writer = PayloadWriter::new();
        writer.put_str(key.service_name());
        writer.put_str(key.object_name());
        writer.put_str(&registration_id.to_string());
        writer.put_bool(self.options.include_value);
        writer.put_bool(local_only);
        writer.put_opt_bytes(self.options.key.as_deref());
        ClientMessage::new(message_type::ADD_ENTRY_LISTENER_REQUEST, writer.finish())
    }

    fn decode_add_response(&self, response: ClientMessage) -> Result<RegisterResponse> {
        let response = response.into_result()?;
        response.expect_type(message_type::ADD_ENTRY_LISTENER_RESPONSE)?;
        let mut reader = PayloadReader::new(response.payload);
        let already_registered = match reader.get_u8()? {
            STATUS_REGISTERED => false,
            STATUS_ALREADY_REGISTERED => true,
            other => {
                return Err(HzlinkError::Decode(format!(
                    "unknown registration status {}",
                    other
                )))
            }
        };
        let handle = reader.get_str()?;
        if handle.is_empty() {
            return Err(HzlinkError::Decode(
                "empty server registration id".to_string(),
            ));
        }
        Ok(RegisterResponse {
            server_registration_id: ServerRegistrationId::new(handle),
            already_registered,
        })
    }

    fn encode_remove_request(
        &self,
        key: &DistributedObjectKey,
        handle: &ServerRegistrationId,
    ) -> Option<ClientMessage> {
        let mut writer = PayloadWriter::new();
        writer.put_str(key.service_name());
        writer.put_str(key.object_name());
        writer.put_str(handle.as_str());
        Some(ClientMessage::new(
            message_type::REMOVE_ENTRY_LISTENER_REQUEST,
            writer.finish(),
        ))
    }
}

/// Decoded form of an [`EntryListenerCodec`] registration request, as seen
/// by the member side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddEntryListenerRequest {
    pub key: DistributedObjectKey,
    pub registration_id: String,
    pub include_value: bool,
    pub local_only: bool,
    pub key_filter: Option<Bytes>,
}

impl AddEntryListenerRequest {
    pub fn decode(request: &ClientMessage) -> Result<Self> {
        request.expect_type(message_type::ADD_ENTRY_LISTENER_REQUEST)?;
        let mut reader = PayloadReader::new(request.payload.clone());
        let service_name = reader.get_str()?;
        let object_name = reader.get_str()?;
        Ok(Self {
            key: DistributedObjectKey::new(service_name, object_name),
            registration_id: reader.get_str()?,
            include_value: reader.get_bool()?,
            local_only: reader.get_bool()?,
            key_filter: reader.get_opt_bytes()?,
        })
    }

    /// Build the response a member sends back.
    pub fn response(
        correlation_id: u64,
        handle: &ServerRegistrationId,
        already_registered: bool,
    ) -> ClientMessage {
        let mut writer = PayloadWriter::new();
        writer.put_u8(if already_registered {
            STATUS_ALREADY_REGISTERED
        } else {
            STATUS_REGISTERED
        });
        writer.put_str(handle.as_str());
        ClientMessage::new(message_type::ADD_ENTRY_LISTENER_RESPONSE, writer.finish())
            .with_correlation_id(correlation_id)
    }
}

/// Decoded form of a deregistration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveEntryListenerRequest {
    pub key: DistributedObjectKey,
    pub server_registration_id: ServerRegistrationId,
}

impl RemoveEntryListenerRequest {
    pub fn decode(request: &ClientMessage) -> Result<Self> {
        request.expect_type(message_type::REMOVE_ENTRY_LISTENER_REQUEST)?;
        let mut reader = PayloadReader::new(request.payload.clone());
        let service_name = reader.get_str()?;
        let object_name = reader.get_str()?;
        Ok(Self {
            key: DistributedObjectKey::new(service_name, object_name),
            server_registration_id: ServerRegistrationId::new(reader.get_str()?),
        })
    }

    pub fn response(correlation_id: u64, removed: bool) -> ClientMessage {
        let mut writer = PayloadWriter::new();
        writer.put_bool(removed);
        ClientMessage::new(message_type::REMOVE_ENTRY_LISTENER_RESPONSE, writer.finish())
            .with_correlation_id(correlation_id)
    }
}

/// Entry event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEvent {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl EntryEvent {
    pub fn encode(&self, correlation_id: u64) -> ClientMessage {
        let mut writer = PayloadWriter::new();
        writer.put_bytes(&self.key);
        writer.put_opt_bytes(self.value.as_deref());
        ClientMessage::new(message_type::ENTRY_EVENT, writer.finish())
            .with_correlation_id(correlation_id)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        Ok(Self {
            key: reader.get_bytes()?,
            value: reader.get_opt_bytes()?,
        })
    }
}
