//! Service plugins registered with the link.

pub mod notifications;

use crate::infrastructure::bluetooth::plugin::ServiceContract;
use notifications::{AncsContract, NotificationUpdate};
use tokio::sync::mpsc;

/// Contracts for every service the daemon understands.
pub fn default_contracts(
    notifications: Option<mpsc::UnboundedSender<NotificationUpdate>>,
) -> Vec<Box<dyn ServiceContract>> {
    vec![Box::new(AncsContract::new(notifications))]
}
