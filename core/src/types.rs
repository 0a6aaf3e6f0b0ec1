// Poll targets, namespaces and snode identifiers

use serde::{Deserialize, Serialize};

/// A storage node inside a swarm
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snode {
    /// Network address ("host:port")
    pub address: String,
    /// Hex-encoded Ed25519 public key of the node
    pub public_key: String,
}

impl Snode {
    pub fn new(address: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: public_key.into(),
        }
    }
}

/// A logical partition of stored messages on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    /// Regular messages
    Default,
    /// User profile shared config
    UserProfileConfig,
    /// Contacts shared config
    ContactsConfig,
    /// Per-conversation settings shared config
    ConversationConfig,
    /// Group membership shared config
    GroupsConfig,
    /// Legacy closed-group messages
    LegacyGroup,
}

impl Namespace {
    /// Config namespaces carry convergent state and are processed with
    /// priority over regular messages.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Namespace::UserProfileConfig
                | Namespace::ContactsConfig
                | Namespace::ConversationConfig
                | Namespace::GroupsConfig
        )
    }

    /// Short tag used in storage keys and log lines
    pub fn tag(&self) -> &'static str {
        match self {
            Namespace::Default => "default",
            Namespace::UserProfileConfig => "cfg_profile",
            Namespace::ContactsConfig => "cfg_contacts",
            Namespace::ConversationConfig => "cfg_convo",
            Namespace::GroupsConfig => "cfg_groups",
            Namespace::LegacyGroup => "legacy_group",
        }
    }
}

/// What is being polled: a user account swarm, a legacy closed-group swarm,
/// or a community server room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollTarget {
    MainAccount {
        /// The user's own account public key
        public_key: String,
    },
    ClosedGroup {
        /// The group's public key (doubles as the thread id)
        group_public_key: String,
    },
    Community {
        /// Base URL of the community server
        server_url: String,
        /// Room token on that server
        room: String,
        /// The server's public key (used for blinded-identity checks)
        server_public_key: String,
    },
}

impl PollTarget {
    /// Stable identifier for scheduler maps and storage keys
    pub fn id(&self) -> String {
        match self {
            PollTarget::MainAccount { public_key } => format!("account:{}", public_key),
            PollTarget::ClosedGroup { group_public_key } => {
                format!("group:{}", group_public_key)
            }
            PollTarget::Community {
                server_url, room, ..
            } => format!("community:{}/{}", server_url, room),
        }
    }

    /// The thread all of this target's group/community traffic lands in.
    /// Main-account traffic resolves threads per sender instead.
    pub fn fixed_thread_id(&self) -> Option<String> {
        match self {
            PollTarget::MainAccount { .. } => None,
            PollTarget::ClosedGroup { group_public_key } => Some(group_public_key.clone()),
            PollTarget::Community {
                server_url, room, ..
            } => Some(format!("{}/{}", server_url, room)),
        }
    }
}

/// Foreground/background hint handed to notification and dispatch logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Foreground,
    Background,
}
