//! EDNS0 negotiation.

use std::net::IpAddr;

use domain::base::iana::OptRcode;
use domain::base::opt::AllOptData;
use domain::base::Message;

use crate::response::{RespEdns, RespOption, Response};

/// The largest UDP payload ever advertised or honored.
pub const MAX_UDP_SIZE: u16 = 1400;

/// The classic DNS minimum, used when the client advertises nothing.
pub const MIN_UDP_SIZE: u16 = 512;

/// What the request's OPT record said.
#[derive(Clone, Debug, Default)]
pub struct ReqEdns {
    pub version: u8,
    pub dnssec_ok: bool,
    pub udp_size: u16,
    pub client_subnet: Option<(IpAddr, u8)>,
    pub has_padding: bool,
}

/// Extract the EDNS parameters of a request, if any.
pub fn parse(msg: &Message<Vec<u8>>) -> Option<ReqEdns> {
    let opt = msg.opt()?;
    let mut edns = ReqEdns {
        version: opt.version(),
        dnssec_ok: opt.dnssec_ok(),
        udp_size: opt.udp_payload_size(),
        client_subnet: None,
        has_padding: false,
    };
    for option in opt.opt().iter::<AllOptData<_, _>>().flatten() {
        match option {
            AllOptData::ClientSubnet(subnet) => {
                if edns.client_subnet.is_none() {
                    edns.client_subnet = Some((subnet.addr(), subnet.source_prefix_len()));
                }
            }
            AllOptData::Padding(_) => edns.has_padding = true,
            _ => {}
        }
    }
    Some(edns)
}

/// Mirror the request's EDNS into the response.
///
/// Returns false on an unsupported EDNS version; the response is then
/// already set up as BADVERS and must be sent as-is.
pub fn check_and_set(req: Option<&ReqEdns>, resp: &mut Response) -> bool {
    let Some(req) = req else {
        return true;
    };
    if req.version != 0 {
        // can't rely on the DO bit of an unknown version
        let mut edns = RespEdns::new(MAX_UDP_SIZE, false);
        edns.rcode = OptRcode::BADVERS;
        resp.edns = Some(edns);
        return false;
    }
    let mut edns = RespEdns::new(MAX_UDP_SIZE, req.dnssec_ok);
    if let Some((addr, source)) = req.client_subnet {
        edns.options.push(RespOption::ClientSubnet { addr, source });
    }
    resp.edns = Some(edns);
    true
}

/// The size limit for a UDP reply.
pub fn max_udp_size(req: Option<&ReqEdns>) -> usize {
    match req {
        Some(edns) => usize::from(edns.udp_size.clamp(MIN_UDP_SIZE, MAX_UDP_SIZE)),
        None => usize::from(MIN_UDP_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_size_is_clamped() {
        assert_eq!(max_udp_size(None), 512);
        let mut edns = ReqEdns::default();
        edns.udp_size = 100;
        assert_eq!(max_udp_size(Some(&edns)), 512);
        edns.udp_size = 1232;
        assert_eq!(max_udp_size(Some(&edns)), 1232);
        edns.udp_size = 4096;
        assert_eq!(max_udp_size(Some(&edns)), 1400);
    }

    #[test]
    fn bad_version_turns_into_badvers() {
        let mut resp = Response::status(
            1,
            domain::base::iana::Opcode::QUERY,
            domain::base::iana::Rcode::NOERROR,
        );
        let req = ReqEdns {
            version: 1,
            ..Default::default()
        };
        assert!(!check_and_set(Some(&req), &mut resp));
        assert_eq!(resp.edns.as_ref().unwrap().rcode, OptRcode::BADVERS);
    }
}
