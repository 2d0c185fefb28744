//! ANCS Notification Plugin
//!
//! Subscribes to Notification Source and Data Source. Each incoming event is
//! queued (replacing a pending event with the same uid), then the
//! attributes of one event at a time are requested over the Control Point
//! and decoded from the Data Source stream.

use crate::domain::command::{Command, IMPORTANCE_MAX};
use crate::domain::models::CharacteristicAddress;
use crate::infrastructure::bluetooth::ancs::{
    notification_attributes_request, perform_action_request, ActionId, AttributeReader,
    EventType, COMMAND_GET_NOTIFICATION_ATTRIBUTES, NotificationAttribute, NotificationEvent,
};
use crate::infrastructure::bluetooth::plugin::{
    CommandHandle, CommandHandler, ServiceContract, ServiceManager,
};
use crate::infrastructure::bluetooth::protocol::ancs;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Decoded notification changes published to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationUpdate {
    Posted {
        event: NotificationEvent,
        attributes: BTreeMap<NotificationAttribute, String>,
    },
    Removed {
        uid: [u8; 4],
    },
}

pub struct AncsContract {
    updates: Option<mpsc::UnboundedSender<NotificationUpdate>>,
}

impl AncsContract {
    pub fn new(updates: Option<mpsc::UnboundedSender<NotificationUpdate>>) -> Self {
        Self { updates }
    }
}

impl ServiceContract for AncsContract {
    fn service_uuid(&self) -> Uuid {
        ancs::SERVICE
    }

    fn characteristics_to_subscribe(&self) -> Vec<CharacteristicAddress> {
        vec![ancs::NOTIFICATION_SOURCE, ancs::DATA_SOURCE]
    }

    fn create_manager(&self, commands: CommandHandle) -> Box<dyn ServiceManager> {
        Box::new(NotificationServiceManager::new(
            commands,
            self.updates.clone(),
        ))
    }
}

/// Ask the phone to run a notification's positive or negative action.
pub fn perform_action(commands: &impl CommandHandler, uid: &[u8; 4], action: ActionId) {
    info!(?uid, ?action, "Performing notification action");
    let request = perform_action_request(uid, action);
    commands.submit(Command::write(ancs::CONTROL_POINT, request).with_importance(IMPORTANCE_MAX));
}

pub struct NotificationServiceManager {
    commands: CommandHandle,
    updates: Option<mpsc::UnboundedSender<NotificationUpdate>>,
    pending: VecDeque<NotificationEvent>,
    reader: Option<AttributeReader>,
    ready: bool,
}

impl NotificationServiceManager {
    pub fn new(
        commands: CommandHandle,
        updates: Option<mpsc::UnboundedSender<NotificationUpdate>>,
    ) -> Self {
        Self {
            commands,
            updates,
            pending: VecDeque::new(),
            reader: None,
            ready: false,
        }
    }

    fn handle_notification_source(&mut self, packet: &[u8]) {
        let event = match NotificationEvent::parse(packet) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping notification source packet: {}", e);
                return;
            }
        };
        debug!(uid = ?event.uid, kind = ?event.event_type, "Notification event");

        self.pending.retain(|queued| queued.uid != event.uid);
        self.pending.push_back(event);
        self.request_next();
    }

    fn handle_data_source(&mut self, packet: &[u8]) {
        let Some(reader) = self.reader.as_mut() else {
            debug!("Data source packet without a pending request");
            return;
        };

        match reader.feed(packet) {
            Ok(_) if reader.is_finished() => {
                if let Some(reader) = self.reader.take() {
                    let (event, attributes) = reader.into_parts();
                    let attributes = attributes
                        .into_iter()
                        .map(|(attribute, value)| {
                            (attribute, String::from_utf8_lossy(&value).into_owned())
                        })
                        .collect();
                    self.publish(NotificationUpdate::Posted { event, attributes });
                }
                self.request_next();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Dropping notification: {}", e);
                self.reader = None;
                self.request_next();
            }
        }
    }

    fn request_next(&mut self) {
        if !self.ready || self.reader.is_some() {
            return;
        }

        while let Some(event) = self.pending.pop_front() {
            let attributes = match event.event_type {
                EventType::Added => attributes_to_read(&event, true),
                EventType::Modified => attributes_to_read(&event, false),
                EventType::Removed => {
                    self.publish(NotificationUpdate::Removed { uid: event.uid });
                    continue;
                }
                EventType::Reserved => {
                    debug!(uid = ?event.uid, "Ignoring reserved event");
                    continue;
                }
            };

            let request = notification_attributes_request(&event.uid, &attributes);
            self.commands.submit(Command::write(ancs::CONTROL_POINT, request));
            self.reader = Some(AttributeReader::new(event, attributes));
            return;
        }
    }

    fn publish(&self, update: NotificationUpdate) {
        info!(?update, "Notification update");
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}

fn attributes_to_read(event: &NotificationEvent, with_app: bool) -> Vec<NotificationAttribute> {
    let mut attributes = Vec::with_capacity(6);
    if with_app {
        attributes.push(NotificationAttribute::AppIdentifier);
    }
    attributes.extend([
        NotificationAttribute::Title,
        NotificationAttribute::Subtitle,
        NotificationAttribute::Message,
    ]);
    if event.flags.positive_action {
        attributes.push(NotificationAttribute::PositiveActionLabel);
    }
    if event.flags.negative_action {
        attributes.push(NotificationAttribute::NegativeActionLabel);
    }
    attributes
}

impl ServiceManager for NotificationServiceManager {
    fn initialize(&mut self) -> Option<Vec<Command>> {
        self.ready = true;
        self.request_next();
        None
    }

    fn can_handle(&self, address: &CharacteristicAddress) -> bool {
        *address == ancs::NOTIFICATION_SOURCE || *address == ancs::DATA_SOURCE
    }

    fn handle(&mut self, address: &CharacteristicAddress, value: &[u8]) {
        if *address == ancs::NOTIFICATION_SOURCE {
            self.handle_notification_source(value);
        } else if *address == ancs::DATA_SOURCE {
            self.handle_data_source(value);
        }
    }

    fn command_exhausted(&mut self, command: &Command) {
        if command.address() != ancs::CONTROL_POINT {
            return;
        }
        let Some(reader) = &self.reader else {
            return;
        };
        let uid = reader.event().uid;
        let is_pending_request = matches!(
            command.payload(),
            Some([COMMAND_GET_NOTIFICATION_ATTRIBUTES, rest @ ..]) if rest.starts_with(&uid)
        );
        if is_pending_request {
            warn!(?uid, "Attribute request was not delivered, skipping notification");
            self.reader = None;
            self.request_next();
        }
    }

    fn close(&mut self) {
        self.ready = false;
        self.reader = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        manager: NotificationServiceManager,
        commands: mpsc::UnboundedReceiver<Command>,
        updates: mpsc::UnboundedReceiver<NotificationUpdate>,
    }

    fn harness() -> Harness {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (update_tx, updates) = mpsc::unbounded_channel();
        let contract = AncsContract::new(Some(update_tx));
        assert_eq!(
            contract.characteristics_to_subscribe(),
            vec![ancs::NOTIFICATION_SOURCE, ancs::DATA_SOURCE]
        );
        Harness {
            manager: NotificationServiceManager::new(CommandHandle::new(command_tx), contract.updates),
            commands,
            updates,
        }
    }

    fn source(event_id: u8, flags: u8, uid: u8) -> Vec<u8> {
        vec![event_id, flags, 1, 1, uid, 0, 0, 0]
    }

    fn response(uid: u8, attributes: &[(u8, &str)]) -> Vec<u8> {
        let mut bytes = vec![0x00, uid, 0, 0, 0];
        for (id, value) in attributes {
            bytes.push(*id);
            bytes.extend_from_slice(&(value.len() as u16).to_le_bytes());
            bytes.extend_from_slice(value.as_bytes());
        }
        bytes
    }

    #[test]
    fn test_pending_events_unique_by_uid() {
        let mut h = harness();
        for (event_id, uid) in [(0, 1), (0, 2), (1, 1), (0, 3), (1, 2)] {
            h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(event_id, 0, uid));
        }

        let uids: Vec<u8> = h.manager.pending.iter().map(|e| e.uid[0]).collect();
        assert_eq!(uids, vec![1, 3, 2]);
        assert_eq!(h.manager.pending[0].event_type, EventType::Modified);
        assert!(h.commands.try_recv().is_err());
    }

    #[test]
    fn test_added_event_requests_and_publishes() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(0, 0x08, 7));

        let command = h.commands.try_recv().unwrap();
        assert_eq!(command.address(), ancs::CONTROL_POINT);
        assert_eq!(
            command.payload(),
            Some(&[0x00, 7, 0, 0, 0, 0x00, 0x01, 0xFF, 0xFF, 0x02, 0xFF, 0xFF, 0x03, 0xFF, 0xFF, 0x06][..])
        );

        // A second event waits for the first response.
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(0, 0, 8));
        assert!(h.commands.try_recv().is_err());

        let bytes = response(
            7,
            &[(0, "com.apple.MobileSMS"), (1, "Ana"), (2, ""), (3, "On my way"), (6, "Reply")],
        );
        let (first, rest) = bytes.split_at(12);
        h.manager.handle(&ancs::DATA_SOURCE, first);
        assert!(h.updates.try_recv().is_err());
        h.manager.handle(&ancs::DATA_SOURCE, rest);

        match h.updates.try_recv().unwrap() {
            NotificationUpdate::Posted { event, attributes } => {
                assert_eq!(event.uid, [7, 0, 0, 0]);
                assert_eq!(attributes[&NotificationAttribute::Title], "Ana");
                assert_eq!(attributes[&NotificationAttribute::Message], "On my way");
                assert_eq!(attributes[&NotificationAttribute::Subtitle], "");
                assert_eq!(attributes[&NotificationAttribute::PositiveActionLabel], "Reply");
            }
            other => panic!("unexpected update {:?}", other),
        }
        assert_eq!(h.commands.try_recv().unwrap().payload().map(|p| p[1]), Some(8));
    }

    #[test]
    fn test_modified_event_skips_app_identifier() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0x10, 3));
        let command = h.commands.try_recv().unwrap();
        assert_eq!(
            command.payload(),
            Some(&[0x00, 3, 0, 0, 0, 0x01, 0xFF, 0xFF, 0x02, 0xFF, 0xFF, 0x03, 0xFF, 0xFF, 0x07][..])
        );
    }

    #[test]
    fn test_removed_and_reserved_events() {
        let mut h = harness();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(2, 0, 4));
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(9, 0, 5));
        h.manager.initialize();

        assert_eq!(
            h.updates.try_recv().unwrap(),
            NotificationUpdate::Removed { uid: [4, 0, 0, 0] }
        );
        assert!(h.updates.try_recv().is_err());
        assert!(h.commands.try_recv().is_err());
        assert!(h.manager.pending.is_empty());
    }

    #[test]
    fn test_mismatched_uid_moves_on() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 1));
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 2));
        h.commands.try_recv().unwrap();

        h.manager.handle(&ancs::DATA_SOURCE, &response(9, &[(1, "x")]));
        assert!(h.updates.try_recv().is_err());
        assert_eq!(h.commands.try_recv().unwrap().payload().map(|p| p[1]), Some(2));
    }

    #[test]
    fn test_retried_request_still_publishes() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 1));
        let mut command = h.commands.try_recv().unwrap();
        command.complete_with_failure();
        assert!(command.should_retry());

        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 2));
        assert!(h.commands.try_recv().is_err());

        h.manager.handle(&ancs::DATA_SOURCE, &response(1, &[(1, "first"), (2, ""), (3, "")]));
        assert_eq!(h.commands.try_recv().unwrap().payload().map(|p| p[1]), Some(2));
        h.manager.handle(&ancs::DATA_SOURCE, &response(2, &[(1, "second"), (2, ""), (3, "")]));

        let titles: Vec<String> = std::iter::from_fn(|| h.updates.try_recv().ok())
            .map(|update| match update {
                NotificationUpdate::Posted { attributes, .. } => {
                    attributes[&NotificationAttribute::Title].clone()
                }
                other => panic!("unexpected update {:?}", other),
            })
            .collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn test_exhausted_request_moves_on() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 1));
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(1, 0, 2));
        let command = h.commands.try_recv().unwrap();

        // Actions on the same uid and other characteristics leave the reader alone.
        let action = perform_action_request(&[1, 0, 0, 0], ActionId::Negative);
        h.manager.command_exhausted(&Command::write(ancs::CONTROL_POINT, action));
        let payload = command.payload().unwrap_or_default().to_vec();
        h.manager.command_exhausted(&Command::write(ancs::DATA_SOURCE, payload));
        assert!(h.commands.try_recv().is_err());

        h.manager.command_exhausted(&command);
        assert_eq!(h.commands.try_recv().unwrap().payload().map(|p| p[1]), Some(2));
        assert!(h.updates.try_recv().is_err());
    }

    #[test]
    fn test_close_drops_state() {
        let mut h = harness();
        h.manager.initialize();
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(0, 0, 1));
        h.manager.handle(&ancs::NOTIFICATION_SOURCE, &source(0, 0, 2));
        h.manager.close();

        assert!(h.manager.reader.is_none());
        assert!(h.manager.pending.is_empty());
        h.manager.handle(&ancs::DATA_SOURCE, &response(1, &[(1, "late")]));
        assert!(h.updates.try_recv().is_err());
    }

    #[test]
    fn test_perform_action_writes_control_point() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        perform_action(&CommandHandle::new(tx), &[1, 2, 3, 4], ActionId::Positive);
        let command = rx.try_recv().unwrap();
        assert_eq!(command.address(), ancs::CONTROL_POINT);
        assert_eq!(command.payload(), Some(&[0x02, 1, 2, 3, 4, 0x00][..]));
        assert_eq!(command.importance(), IMPORTANCE_MAX);
    }
}
