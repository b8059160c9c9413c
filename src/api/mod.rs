//! External collaborators: broker gateway, paper broker, notifications.

mod gateway_client;
mod notify;
mod paper;
mod traits;
mod types;

pub use gateway_client::{GatewayClient, GatewayFeed};
pub use notify::{ConsoleNotifier, NullNotifier};
pub use paper::{PaperBroker, PaperOrder};
pub use traits::{
    BalanceProvider, Clock, NotificationSink, OrderPlacement, OrderReceipt, OrderRequest,
    SourceEventFeed, Subscription, SystemClock,
};
pub use types::SettlementResponse;
