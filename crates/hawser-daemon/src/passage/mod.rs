//! Passage types: the forwarding rules pushed to nodes.
//!
//! Passages are ephemeral -- they are recomputed from the ticket store on
//! every push and never persisted. Credentials inside them are one-way
//! derivations of the tickets involved (see [`hawser_crypto::derive`]), so
//! revoking a ticket silently revokes every passage referencing it.

pub mod resolver;

use hawser_crypto::{derive_password, derive_uuid};

/// Proxy protocol a node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum Protocol {
    Shadowsocks,
    VmessTcp,
    VmessTlsGrpc,
    Juicity,
}

impl Protocol {
    pub const ALL: [Self; 4] = [
        Self::Shadowsocks,
        Self::VmessTcp,
        Self::VmessTlsGrpc,
        Self::Juicity,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shadowsocks => "shadowsocks",
            Self::VmessTcp => "vmess_tcp",
            Self::VmessTlsGrpc => "vmess_tls_grpc",
            Self::Juicity => "juicity",
        }
    }

    /// Cipher/method constant node agents expect for this protocol.
    pub const fn default_method(self) -> &'static str {
        match self {
            Self::Shadowsocks => "chacha20-ietf-poly1305",
            Self::VmessTcp | Self::VmessTlsGrpc => "aes-128-gcm",
            Self::Juicity => "",
        }
    }

    /// Whether the protocol authenticates clients by a UUID user id in
    /// addition to (or instead of) a password.
    const fn uses_user_id(self) -> bool {
        !matches!(self, Self::Shadowsocks)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credential material for one side of a passage.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Argument {
    pub protocol: Protocol,
    pub username: String,
    pub password: String,
    pub method: String,
}

impl Argument {
    /// Management credential as registered by a node.
    pub fn management(protocol: Protocol, username: &str, password: &str) -> Self {
        Self {
            protocol,
            username: username.to_string(),
            password: password.to_string(),
            method: protocol.default_method().to_string(),
        }
    }

    /// Direct credential for `subject_ticket` (a user or a relay) on the
    /// server owning `server_ticket`.
    pub fn for_user(protocol: Protocol, server_ticket: &str, subject_ticket: &str) -> Self {
        Self::derived(protocol, &[server_ticket, subject_ticket])
    }

    /// Relay-mediated credential for `user_ticket` arriving at
    /// `server_ticket` through `relay_ticket`. A three-way derivation,
    /// distinct from the direct form by construction.
    pub fn for_relay_user(
        protocol: Protocol,
        server_ticket: &str,
        relay_ticket: &str,
        user_ticket: &str,
    ) -> Self {
        Self::derived(protocol, &[server_ticket, relay_ticket, user_ticket])
    }

    fn derived(protocol: Protocol, parts: &[&str]) -> Self {
        let username = if protocol.uses_user_id() {
            derive_uuid(parts).to_string()
        } else {
            String::new()
        };
        Self {
            protocol,
            username,
            password: derive_password(parts),
            method: protocol.default_method().to_string(),
        }
    }
}

/// Inbound half of a forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassageIn {
    /// Relay name the traffic arrives from; `None` for direct user traffic.
    pub from: Option<String>,
    pub argument: Argument,
}

/// Outbound leg of a relay passage: the credential the relay itself
/// presents to the target endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassageOut {
    pub to: String,
    pub host: String,
    pub port: u16,
    pub argument: Argument,
}

/// One forwarding rule pushed to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub inbound: PassageIn,
    pub outbound: Option<PassageOut>,
}

// =============================================================================
// Proto conversions
// =============================================================================

impl From<Protocol> for hawser_proto::v1::Protocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Shadowsocks => Self::Shadowsocks,
            Protocol::VmessTcp => Self::VmessTcp,
            Protocol::VmessTlsGrpc => Self::VmessTlsGrpc,
            Protocol::Juicity => Self::Juicity,
        }
    }
}

impl TryFrom<hawser_proto::v1::Protocol> for Protocol {
    type Error = UnknownProtocol;

    fn try_from(protocol: hawser_proto::v1::Protocol) -> Result<Self, Self::Error> {
        match protocol {
            hawser_proto::v1::Protocol::Shadowsocks => Ok(Self::Shadowsocks),
            hawser_proto::v1::Protocol::VmessTcp => Ok(Self::VmessTcp),
            hawser_proto::v1::Protocol::VmessTlsGrpc => Ok(Self::VmessTlsGrpc),
            hawser_proto::v1::Protocol::Juicity => Ok(Self::Juicity),
            hawser_proto::v1::Protocol::Unspecified => Err(UnknownProtocol),
        }
    }
}

/// A wire message carried no usable protocol variant.
#[derive(Debug, thiserror::Error)]
#[error("protocol is missing or unspecified")]
pub struct UnknownProtocol;

impl From<Argument> for hawser_proto::v1::Argument {
    fn from(argument: Argument) -> Self {
        Self {
            protocol: hawser_proto::v1::Protocol::from(argument.protocol).into(),
            username: argument.username,
            password: argument.password,
            method: argument.method,
        }
    }
}

impl TryFrom<hawser_proto::v1::Argument> for Argument {
    type Error = UnknownProtocol;

    fn try_from(argument: hawser_proto::v1::Argument) -> Result<Self, Self::Error> {
        let protocol = hawser_proto::v1::Protocol::try_from(argument.protocol)
            .map_err(|_| UnknownProtocol)?
            .try_into()?;
        Ok(Self {
            protocol,
            username: argument.username,
            password: argument.password,
            method: argument.method,
        })
    }
}

impl From<Passage> for hawser_proto::v1::Passage {
    fn from(passage: Passage) -> Self {
        Self {
            inbound: Some(hawser_proto::v1::PassageIn {
                from: passage.inbound.from.unwrap_or_default(),
                argument: Some(passage.inbound.argument.into()),
            }),
            outbound: passage.outbound.map(|out| hawser_proto::v1::PassageOut {
                to: out.to,
                host: out.host,
                port: u32::from(out.port),
                argument: Some(out.argument.into()),
            }),
        }
    }
}
