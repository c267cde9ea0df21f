//! Per-leg protocol state.

use crate::protocol::mysql::basic::ConnectAttributes;
use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};

/// The router only tracks the handle; statement metadata stays on the
/// server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedStatement {
    pub num_params: u16,
    pub num_columns: u16,
}

/// At most one captured password form is held at a time; an empty password
/// is "captured as empty".
#[derive(Debug, Clone, PartialEq, Eq)]
enum PasswordSecret {
    Plain(Vec<u8>),
    Scrambled(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolState {
    /// capabilities the client side of this leg advertised.
    pub client_capabilities: CapabilityFlags,
    /// capabilities the server side of this leg advertised.
    pub server_capabilities: CapabilityFlags,

    pub auth_method_name: Vec<u8>,
    /// the nonce/scramble of the current auth exchange.
    pub auth_method_data: Vec<u8>,
    password: Option<PasswordSecret>,

    pub username: Option<Vec<u8>>,
    pub schema: Option<Vec<u8>>,
    pub collation: u16,
    pub max_packet_len: u32,
    /// connection attributes as sent on this leg.
    pub attributes: Option<ConnectAttributes>,

    /// shadow of the latest status flags seen in Ok/Eof packets.
    pub status_flags: StatusFlags,
    pub prepared_statements: HashMap<u32, PreparedStatement>,

    pub server_greeting_received: bool,
}

impl ProtocolState {
    pub fn shared_capabilities(&self) -> CapabilityFlags {
        self.client_capabilities & self.server_capabilities
    }

    pub fn set_password_plain(&mut self, password: Vec<u8>) {
        self.password = Some(PasswordSecret::Plain(password));
    }

    pub fn set_password_scrambled(&mut self, scramble: Vec<u8>) {
        self.password = Some(PasswordSecret::Scrambled(scramble));
    }

    pub fn clear_password(&mut self) {
        self.password = None;
    }

    pub fn password_plain(&self) -> Option<&[u8]> {
        match &self.password {
            Some(PasswordSecret::Plain(p)) => Some(p),
            _ => None,
        }
    }

    pub fn password_scrambled(&self) -> Option<&[u8]> {
        match &self.password {
            Some(PasswordSecret::Scrambled(s)) => Some(s),
            _ => None,
        }
    }

    /// Re-auth (ChangeUser) resets everything the old identity owned.
    pub fn reset_for_change_user(&mut self) {
        self.prepared_statements.clear();
        self.clear_password();
        self.attributes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_password_form() {
        let mut state = ProtocolState::default();
        state.set_password_scrambled(vec![1, 2, 3]);
        assert!(state.password_scrambled().is_some());

        state.set_password_plain(b"secret".to_vec());
        assert_eq!(state.password_plain(), Some(&b"secret"[..]));
        assert!(state.password_scrambled().is_none());
    }

    #[test]
    fn empty_password_is_captured_as_empty() {
        let mut state = ProtocolState::default();
        state.set_password_plain(Vec::new());
        assert_eq!(state.password_plain(), Some(&[][..]));
    }

    #[test]
    fn shared_caps_are_the_intersection() {
        let mut state = ProtocolState::default();
        state.client_capabilities =
            CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_SSL;
        state.server_capabilities =
            CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        assert_eq!(
            state.shared_capabilities(),
            CapabilityFlags::CLIENT_PROTOCOL_41
        );
    }
}
