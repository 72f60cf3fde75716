//! Link-role classification and connection ranking.
//!
//! A robot can expose its broker on two radios. The secondary link (HaLow
//! bridge) is preferred when both answer: it reports a locally administered
//! MAC or a vendor hostname.

use std::fmt;

use serde::Serialize;

use super::Endpoint;

/// Locally administered bit of the first MAC octet.
const LOCAL_ADMIN_BIT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
    /// Neither MAC nor hostname known. Ranked like primary.
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Unknown => "unknown",
        })
    }
}

fn first_octet(mac: &str) -> Option<u8> {
    let octet = mac.split([':', '-']).next()?;
    u8::from_str_radix(octet, 16).ok()
}

pub fn is_locally_administered(mac: &str) -> bool {
    first_octet(mac).is_some_and(|octet| octet & LOCAL_ADMIN_BIT != 0)
}

pub fn classify(mac: Option<&str>, hostname: Option<&str>, vendor_markers: &[String]) -> Role {
    if mac.is_none() && hostname.is_none() {
        return Role::Unknown;
    }

    let vendor_host = hostname.is_some_and(|name| {
        let name = name.to_lowercase();
        vendor_markers
            .iter()
            .any(|marker| !marker.is_empty() && name.contains(&marker.to_lowercase()))
    });

    if mac.is_some_and(is_locally_administered) || vendor_host {
        Role::Secondary
    } else {
        Role::Primary
    }
}

/// Marks exactly one endpoint as recommended, keeping input order.
///
/// Secondaries win over primary/unknown links; ties go to the lowest address.
pub fn rank(mut endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let has_secondary = endpoints.iter().any(|e| e.role == Role::Secondary);
    let best = endpoints
        .iter()
        .enumerate()
        .filter(|(_, e)| !has_secondary || e.role == Role::Secondary)
        .min_by_key(|(_, e)| e.address)
        .map(|(index, _)| index);

    for (index, endpoint) in endpoints.iter_mut().enumerate() {
        endpoint.recommended = Some(index) == best;
    }
    endpoints
}

/// Recommended endpoint first, the rest in their original order.
pub fn connection_order(endpoints: &[Endpoint]) -> Vec<Endpoint> {
    let (mut ordered, rest): (Vec<Endpoint>, Vec<Endpoint>) =
        endpoints.iter().cloned().partition(|e| e.recommended);
    ordered.extend(rest);
    ordered
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    fn markers() -> Vec<String> {
        vec!["yarbo".into(), "snowbot".into()]
    }

    fn endpoint(addr: &str, role: Role) -> Endpoint {
        Endpoint {
            address: addr.parse::<IpAddr>().unwrap(),
            port: 1883,
            role,
            mac: None,
            hostname: None,
            recommended: false,
            serial: Some("SN1".into()),
        }
    }

    fn recommended(endpoints: &[Endpoint]) -> Vec<String> {
        endpoints
            .iter()
            .filter(|e| e.recommended)
            .map(|e| e.address.to_string())
            .collect()
    }

    #[test]
    fn test_classify_by_mac_bit() {
        assert_eq!(classify(Some("02:11:22:33:44:55"), None, &markers()), Role::Secondary);
        assert_eq!(classify(Some("5e:00:00:00:00:01"), None, &markers()), Role::Secondary);
        assert_eq!(classify(Some("5c:ab:12:00:00:01"), None, &markers()), Role::Primary);
        assert_eq!(classify(Some("AC-DE-48-00-11-22"), None, &markers()), Role::Primary);
    }

    #[test]
    fn test_classify_by_hostname() {
        assert_eq!(
            classify(Some("5c:ab:12:00:00:01"), Some("YARBO-G1.lan"), &markers()),
            Role::Secondary
        );
        assert_eq!(classify(None, Some("snowbot-halow"), &markers()), Role::Secondary);
        assert_eq!(classify(None, Some("router.lan"), &markers()), Role::Primary);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify(None, None, &markers()), Role::Unknown);
    }

    #[test]
    fn test_rank_single() {
        let ranked = rank(vec![endpoint("192.168.1.24", Role::Primary)]);
        assert_eq!(recommended(&ranked), ["192.168.1.24"]);
    }

    #[test]
    fn test_rank_prefers_secondary() {
        let ranked = rank(vec![
            endpoint("192.168.1.24", Role::Primary),
            endpoint("192.168.1.55", Role::Secondary),
        ]);
        assert_eq!(recommended(&ranked), ["192.168.1.55"]);
        // Input order is untouched.
        assert_eq!(ranked[0].address.to_string(), "192.168.1.24");
    }

    #[test]
    fn test_rank_lowest_address_tie_break() {
        let ranked = rank(vec![
            endpoint("192.168.1.30", Role::Primary),
            endpoint("192.168.1.4", Role::Unknown),
            endpoint("192.168.1.24", Role::Primary),
        ]);
        assert_eq!(recommended(&ranked), ["192.168.1.4"]);

        let secondaries = rank(vec![
            endpoint("192.168.1.1", Role::Primary),
            endpoint("192.168.1.90", Role::Secondary),
            endpoint("192.168.1.55", Role::Secondary),
        ]);
        assert_eq!(recommended(&secondaries), ["192.168.1.55"]);
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank(Vec::new()).is_empty());
    }

    #[test]
    fn test_connection_order() {
        let ranked = rank(vec![
            endpoint("192.168.1.24", Role::Primary),
            endpoint("192.168.8.8", Role::Primary),
            endpoint("192.168.1.55", Role::Secondary),
        ]);
        let order: Vec<String> = connection_order(&ranked)
            .iter()
            .map(|e| e.address.to_string())
            .collect();
        assert_eq!(order, ["192.168.1.55", "192.168.1.24", "192.168.8.8"]);
    }
}
