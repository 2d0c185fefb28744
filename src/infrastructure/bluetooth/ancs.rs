//! ANCS Wire Protocol
//!
//! Notification Source events, Control Point requests and the Data Source
//! attribute stream.
//!
//! # Notification Source packet (8 bytes)
//!
//! ```text
//! [0]    : Event id (added, modified, removed)
//! [1]    : Event flags
//! [2]    : Category id
//! [3]    : Category count
//! [4-7]  : Notification uid
//! ```
//!
//! # Data Source response
//!
//! ```text
//! [0]    : Command id echo
//! [1-4]  : Notification uid echo
//! then per attribute:
//!   [0]    : Attribute id
//!   [1-2]  : Value length (u16 little-endian)
//!   [3..]  : Value bytes
//! ```
//!
//! A response is split over as many Data Source packets as needed, at any
//! byte offset, including inside an attribute header.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

pub const COMMAND_GET_NOTIFICATION_ATTRIBUTES: u8 = 0;
pub const COMMAND_GET_APP_ATTRIBUTES: u8 = 1;
pub const COMMAND_PERFORM_NOTIFICATION_ACTION: u8 = 2;

pub const EVENT_PACKET_LEN: usize = 8;
const RESPONSE_ECHO_LEN: usize = 5;
const ATTRIBUTE_HEADER_LEN: usize = 3;
/// Requested maximum length for variable-length attributes
const MAX_ATTRIBUTE_LEN: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("notification event needs 8 bytes, got {0}")]
    TruncatedEvent(usize),
    #[error("attribute response echoes uid {actual:02X?}, expected {expected:02X?}")]
    UnexpectedUid { expected: [u8; 4], actual: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Removed,
    Reserved,
}

impl EventType {
    pub fn from_raw(id: u8) -> Self {
        match id {
            0 => Self::Added,
            1 => Self::Modified,
            2 => Self::Removed,
            _ => Self::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Other,
    IncomingCall,
    MissedCall,
    Voicemail,
    Social,
    Schedule,
    Email,
    News,
    HealthAndFitness,
    BusinessAndFinance,
    Location,
    Entertainment,
    Reserved,
}

impl Category {
    pub fn from_raw(id: u8) -> Self {
        match id {
            0 => Self::Other,
            1 => Self::IncomingCall,
            2 => Self::MissedCall,
            3 => Self::Voicemail,
            4 => Self::Social,
            5 => Self::Schedule,
            6 => Self::Email,
            7 => Self::News,
            8 => Self::HealthAndFitness,
            9 => Self::BusinessAndFinance,
            10 => Self::Location,
            11 => Self::Entertainment,
            _ => Self::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags {
    pub silent: bool,
    pub important: bool,
    pub pre_existing: bool,
    pub positive_action: bool,
    pub negative_action: bool,
}

impl EventFlags {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            silent: bits & 0x01 != 0,
            important: bits & 0x02 != 0,
            pre_existing: bits & 0x04 != 0,
            positive_action: bits & 0x08 != 0,
            negative_action: bits & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub uid: [u8; 4],
    pub event_type: EventType,
    pub flags: EventFlags,
    pub category: Category,
    pub category_count: u8,
}

impl NotificationEvent {
    pub fn parse(packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < EVENT_PACKET_LEN {
            return Err(DecodeError::TruncatedEvent(packet.len()));
        }
        Ok(Self {
            uid: [packet[4], packet[5], packet[6], packet[7]],
            event_type: EventType::from_raw(packet[0]),
            flags: EventFlags::from_bits(packet[1]),
            category: Category::from_raw(packet[2]),
            category_count: packet[3],
        })
    }

    pub fn uid_value(&self) -> u32 {
        u32::from_le_bytes(self.uid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationAttribute {
    AppIdentifier,
    Title,
    Subtitle,
    Message,
    MessageSize,
    Date,
    PositiveActionLabel,
    NegativeActionLabel,
    Reserved,
}

impl NotificationAttribute {
    pub fn from_raw(id: u8) -> Self {
        match id {
            0 => Self::AppIdentifier,
            1 => Self::Title,
            2 => Self::Subtitle,
            3 => Self::Message,
            4 => Self::MessageSize,
            5 => Self::Date,
            6 => Self::PositiveActionLabel,
            7 => Self::NegativeActionLabel,
            _ => Self::Reserved,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::AppIdentifier => 0,
            Self::Title => 1,
            Self::Subtitle => 2,
            Self::Message => 3,
            Self::MessageSize => 4,
            Self::Date => 5,
            Self::PositiveActionLabel => 6,
            Self::NegativeActionLabel => 7,
            Self::Reserved => 255,
        }
    }

    /// Title, Subtitle and Message carry a max-length parameter in requests.
    pub fn needs_length(self) -> bool {
        matches!(self, Self::Title | Self::Subtitle | Self::Message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionId {
    Positive = 0,
    Negative = 1,
}

/// Control Point request for a notification's attributes.
pub fn notification_attributes_request(
    uid: &[u8; 4],
    attributes: &[NotificationAttribute],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(RESPONSE_ECHO_LEN + attributes.len() * 3);
    packet.push(COMMAND_GET_NOTIFICATION_ATTRIBUTES);
    packet.extend_from_slice(uid);
    for attribute in attributes {
        packet.push(attribute.id());
        if attribute.needs_length() {
            packet.extend_from_slice(&MAX_ATTRIBUTE_LEN.to_le_bytes());
        }
    }
    packet
}

/// Control Point request triggering a notification's positive or negative action.
pub fn perform_action_request(uid: &[u8; 4], action: ActionId) -> Vec<u8> {
    let mut packet = Vec::with_capacity(6);
    packet.push(COMMAND_PERFORM_NOTIFICATION_ACTION);
    packet.extend_from_slice(uid);
    packet.push(action as u8);
    packet
}

/// Streaming decoder for one Get Notification Attributes response.
#[derive(Debug)]
pub struct AttributeReader {
    event: NotificationEvent,
    remaining: Vec<NotificationAttribute>,
    awaiting_echo: bool,
    current: Option<NotificationAttribute>,
    bytes_left: usize,
    value: Vec<u8>,
    carry: Vec<u8>,
    attributes: BTreeMap<NotificationAttribute, Vec<u8>>,
}

impl AttributeReader {
    pub fn new(event: NotificationEvent, requested: Vec<NotificationAttribute>) -> Self {
        Self {
            event,
            remaining: requested,
            awaiting_echo: true,
            current: None,
            bytes_left: 0,
            value: Vec::new(),
            carry: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn event(&self) -> &NotificationEvent {
        &self.event
    }

    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn attributes(&self) -> &BTreeMap<NotificationAttribute, Vec<u8>> {
        &self.attributes
    }

    pub fn text(&self, attribute: NotificationAttribute) -> Option<String> {
        self.attributes
            .get(&attribute)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    pub fn into_parts(self) -> (NotificationEvent, BTreeMap<NotificationAttribute, Vec<u8>>) {
        (self.event, self.attributes)
    }

    /// Consume one Data Source packet and return the attributes it completed.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Vec<NotificationAttribute>, DecodeError> {
        if self.is_finished() {
            return Ok(Vec::new());
        }

        let mut input = packet;
        if self.awaiting_echo {
            self.awaiting_echo = false;
            let echoed = packet.get(1..RESPONSE_ECHO_LEN);
            if echoed != Some(&self.event.uid[..]) {
                self.remaining.clear();
                warn!(uid = ?self.event.uid, "Attribute response for another notification");
                return Err(DecodeError::UnexpectedUid {
                    expected: self.event.uid,
                    actual: echoed.map(<[u8]>::to_vec).unwrap_or_default(),
                });
            }
            input = &packet[RESPONSE_ECHO_LEN..];
        }

        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(input);
        let mut cursor = data.as_slice();
        let mut completed = Vec::new();

        while !self.remaining.is_empty() {
            let attribute = match self.current {
                Some(attribute) => attribute,
                None => {
                    if cursor.len() < ATTRIBUTE_HEADER_LEN {
                        self.carry.extend_from_slice(cursor);
                        break;
                    }
                    let attribute = NotificationAttribute::from_raw(cursor[0]);
                    self.bytes_left = u16::from_le_bytes([cursor[1], cursor[2]]) as usize;
                    self.current = Some(attribute);
                    cursor = &cursor[ATTRIBUTE_HEADER_LEN..];
                    attribute
                }
            };

            let take = self.bytes_left.min(cursor.len());
            self.value.extend_from_slice(&cursor[..take]);
            cursor = &cursor[take..];
            self.bytes_left -= take;

            if self.bytes_left > 0 {
                break;
            }
            self.finish_attribute(attribute);
            completed.push(attribute);
        }

        Ok(completed)
    }

    fn finish_attribute(&mut self, attribute: NotificationAttribute) {
        let value = std::mem::take(&mut self.value);
        debug!(?attribute, len = value.len(), "Attribute complete");
        self.current = None;
        self.attributes.insert(attribute, value);
        self.remaining.retain(|a| *a != attribute);
    }
}
