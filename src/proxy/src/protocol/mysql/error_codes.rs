//! Error codes the router emits on its own behalf.
//!
//! Server-side (`ER_*`) and client-library (`CR_*`) codes share one wire
//! format; the router uses both families depending on which side of the
//! conversation failed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
    ER_CON_COUNT_ERROR = 1040,
    ER_HANDSHAKE_ERROR = 1043,
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_UNKNOWN_ERROR = 1105,
    ER_NET_PACKETS_OUT_OF_ORDER = 1156,
    ER_ACCESS_DENIED_NO_PASSWORD_ERROR = 1698,
    ER_WRONG_COMPRESSION_ALGORITHM_CLIENT = 3835,

    CR_SERVER_GONE_ERROR = 2006,
    CR_SERVER_LOST = 2013,
    CR_SSL_CONNECTION_ERROR = 2026,
    CR_AUTH_PLUGIN_CANNOT_LOAD = 2059,
}

impl ErrorKind {
    pub fn sqlstate(&self) -> &'static [u8; 5] {
        match self {
            ErrorKind::ER_CON_COUNT_ERROR => b"08004",
            ErrorKind::ER_HANDSHAKE_ERROR => b"08S01",
            ErrorKind::ER_NET_PACKETS_OUT_OF_ORDER => b"08S01",
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_ACCESS_DENIED_NO_PASSWORD_ERROR => b"28000",
            _ => b"HY000",
        }
    }
}
