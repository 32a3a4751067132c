//! Outbound Twitch surface: the identity service (OAuth) and the Helix API,
//! plus the EventSub notification payloads the core consumes.

pub mod events;
pub mod helix;
pub mod oauth;

pub use events::{EventNotification, RaidEvent, StreamOfflineEvent, StreamOnlineEvent};
pub use helix::{HelixClient, HelixError, RaidError, StreamInfo, UserInfo};
pub use oauth::{AuthStateStore, TokenError, TokenGrant, TwitchOAuth, RAID_SCOPES};
