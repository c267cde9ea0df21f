use mysql_common::constants::CapabilityFlags;
use num_derive::{FromPrimitive, ToPrimitive};
use std::sync::OnceLock;
use strum_macros::{AsRefStr, EnumString};

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1: the first 8 bytes of the nonce; the rest follows
/// the 10-byte filler in the greeting.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;

/// Nonce length (auth-plugin-data-part-1 + auth-plugin-data-part-2).
pub const SCRAMBLE_SIZE: usize = 20;

/// Handshake v10; the only protocol version the router speaks.
pub const PROTOCOL_VERSION: u8 = 10;

/// Version string the router reports when it synthesises the greeting.
pub const ROUTER_VERSION: &str = concat!("8.4.0", "-router");

/// caching-sha2 in-band tags, carried in AuthMoreData (0x01) frames.
pub const CACHING_SHA2_FAST_AUTH_OK: u8 = 0x03;
pub const CACHING_SHA2_FULL_AUTH_REQUESTED: u8 = 0x04;
pub const CACHING_SHA2_PUBLIC_KEY_REQUEST: u8 = 0x02;
pub const SHA256_PUBLIC_KEY_REQUEST: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "mysql_clear_password")]
    AuthClearPassword,
    // forces the server into an auth-method-switch; never accepted from
    // clients.
    #[strum(serialize = "switch_me_if_you_can")]
    SwitchMeIfYouCan,
}

impl AuthPluginName {
    /// The methods the router honours from clients; anything else is
    /// answered with CR_AUTH_PLUGIN_CANNOT_LOAD.
    pub fn is_supported(name: &[u8]) -> bool {
        matches!(
            name,
            b"caching_sha2_password"
                | b"mysql_native_password"
                | b"mysql_clear_password"
                | b"sha256_password"
        )
    }
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    AuthMoreDataHeader = 0x01,
    LocalInFileHeader = 0xfb,
    EOFHeader = 0xfe,
    ErrHeader = 0xff,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

/// The capability subset the router advertises to clients.
///
/// Compression bits are never part of it; `CLIENT_SSL` is added separately
/// iff the route's client_ssl_mode is not DISABLED.
pub fn router_capabilities() -> CapabilityFlags {
    static ROUTER_CAPABILITIES: OnceLock<CapabilityFlags> = OnceLock::new();
    *ROUTER_CAPABILITIES.get_or_init(|| {
        CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_FOUND_ROWS
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_NO_SCHEMA
            | CapabilityFlags::CLIENT_ODBC
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_INTERACTIVE
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_OPTIONAL_RESULTSET_METADATA
    })
}
