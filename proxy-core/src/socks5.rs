//! SOCKS5 wire types (RFC 1928), with the lenient version check from
//! spec.md §4.2/§9: a greeting whose version byte isn't 5 still gets a v5
//! `NO_AUTH` reply rather than a hard failure, for compatibility with
//! clients that send a malformed first byte.

pub const VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_SUPPORTED: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_GENERAL_FAILURE: u8 = 0x01;
pub const STATUS_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const STATUS_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
pub const STATUS_NETWORK_UNREACHABLE: u8 = 0x03;

#[derive(Debug, Clone)]
pub struct GreetingRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct GreetingResponse {
    pub auth_type: u8,
}

impl GreetingResponse {
    pub fn to_bytes(self) -> [u8; 2] {
        [VERSION, self.auth_type]
    }
}

/// Destination address as carried on the wire, in whichever `ATYP` form the
/// client sent.
#[derive(Debug, Clone)]
pub enum Addr {
    V4(std::net::Ipv4Addr),
    Domain(String),
    V6(std::net::Ipv6Addr),
}

impl Addr {
    pub fn atyp(&self) -> u8 {
        match self {
            Addr::V4(_) => ATYP_IPV4,
            Addr::Domain(_) => ATYP_DOMAIN,
            Addr::V6(_) => ATYP_IPV6,
        }
    }

    pub fn host_string(&self) -> String {
        match self {
            Addr::V4(a) => a.to_string(),
            Addr::Domain(d) => d.clone(),
            Addr::V6(a) => a.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub version: u8,
    pub cmd: u8,
    pub addr: Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: u8,
    pub addr: Addr,
    pub port: u16,
}

impl ConnectResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![VERSION, self.status, 0x00, self.addr.atyp()];
        match &self.addr {
            Addr::V4(a) => out.extend_from_slice(&a.octets()),
            Addr::V6(a) => out.extend_from_slice(&a.octets()),
            Addr::Domain(d) => {
                out.push(d.len() as u8);
                out.extend_from_slice(d.as_bytes());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }
}

pub fn parse_greeting(buf: &[u8]) -> Option<GreetingRequest> {
    if buf.len() < 2 {
        return None;
    }
    let version = buf[0];
    let nmethods = buf[1] as usize;
    if buf.len() < 2 + nmethods {
        return None;
    }
    Some(GreetingRequest {
        version,
        methods: buf[2..2 + nmethods].to_vec(),
    })
}

/// Parses a fixed-header-plus-variable-address request (used for both the
/// SOCKS5 CONNECT request and its reply's echoed address). Returns the
/// parsed value and the total byte length consumed, or `None` if more bytes
/// are needed for the `atyp`-dependent tail.
pub fn parse_connect_request(buf: &[u8]) -> Option<(ConnectRequest, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let version = buf[0];
    let cmd = buf[1];
    // buf[2] is reserved.
    let atyp = buf[3];
    let (addr, addr_len) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 4 + 4 {
                return None;
            }
            let octets = [buf[4], buf[5], buf[6], buf[7]];
            (Addr::V4(std::net::Ipv4Addr::from(octets)), 4)
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return None;
            }
            let len = buf[4] as usize;
            if buf.len() < 5 + len {
                return None;
            }
            let domain = String::from_utf8_lossy(&buf[5..5 + len]).to_string();
            (Addr::Domain(domain), 1 + len)
        }
        ATYP_IPV6 => {
            if buf.len() < 4 + 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            (Addr::V6(std::net::Ipv6Addr::from(octets)), 16)
        }
        _ => return None,
    };
    let total = 4 + addr_len + 2;
    if buf.len() < total {
        return None;
    }
    let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
    Some((
        ConnectRequest {
            version,
            cmd,
            addr,
            port,
        },
        total,
    ))
}
