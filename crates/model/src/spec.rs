use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Upper bound on subnets per request.
pub const MAX_SUBNETS: usize = 10;

/// The requested shape of a virtual network and its sub-networks.
///
/// Validated once at the submission boundary; the executor trusts the
/// stored copy apart from re-checking [`MAX_SUBNETS`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkRequestSpec {
    #[serde(rename = "vpc")]
    pub network: NetworkSpec,
    pub subnets: Vec<SubnetSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkSpec {
    pub cidr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubnetSpec {
    pub cidr: String,
    pub az: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A malformed request spec, rejected before any state is created.
#[derive(Debug)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: String) -> Self {
        ValidationError { message }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_str())
    }
}

impl std::error::Error for ValidationError {}

impl NetworkRequestSpec {
    /// Validate the whole spec: a strict network CIDR, between one and
    /// [`MAX_SUBNETS`] subnets, each with a strict CIDR inside the
    /// network range and overlapping none of the earlier subnets.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let network: IpNet = parse_strict_cidr(&self.network.cidr)
            .map_err(|err| ValidationError::new(format!("Invalid network CIDR: {err}")))?;

        if self.subnets.is_empty() {
            return Err(ValidationError::new("Missing 'subnets' array".to_string()));
        }

        if self.subnets.len() > MAX_SUBNETS {
            return Err(ValidationError::new(format!(
                "Too many subnets: {} (max {MAX_SUBNETS})",
                self.subnets.len()
            )));
        }

        let mut seen: Vec<IpNet> = Vec::with_capacity(self.subnets.len());

        for (index, subnet) in self.subnets.iter().enumerate() {
            if subnet.az.is_empty() {
                return Err(ValidationError::new(format!(
                    "Subnet at index {index} missing 'az'"
                )));
            }

            if let Some(name) = &subnet.name {
                if name.is_empty() {
                    return Err(ValidationError::new(format!(
                        "Subnet at index {index} has invalid 'name'"
                    )));
                }
            }

            let parsed: IpNet = parse_strict_cidr(&subnet.cidr).map_err(|err| {
                ValidationError::new(format!("Invalid subnet CIDR at index {index}: {err}"))
            })?;

            if !network.contains(&parsed) {
                return Err(ValidationError::new(format!(
                    "Subnet CIDR '{}' is not within network CIDR '{}'",
                    subnet.cidr, self.network.cidr
                )));
            }

            for prior in seen.iter() {
                if overlaps(&parsed, prior) {
                    return Err(ValidationError::new(format!(
                        "Subnet CIDR '{}' overlaps with '{prior}'",
                        subnet.cidr
                    )));
                }
            }

            seen.push(parsed);
        }

        Ok(())
    }
}

/// Parse a CIDR block, rejecting any with host bits set.
fn parse_strict_cidr(cidr: &str) -> Result<IpNet, String> {
    let net: IpNet = cidr
        .parse()
        .map_err(|err| format!("'{cidr}': {err}"))?;

    if net.addr() != net.network() {
        return Err(format!("'{cidr}' has host bits set"));
    }

    Ok(net)
}

// CIDR blocks overlap exactly when one contains the other.
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(cidr: &str, az: &str) -> SubnetSpec {
        SubnetSpec {
            cidr: cidr.to_string(),
            az: az.to_string(),
            name: None,
        }
    }

    fn spec(network: &str, subnets: Vec<SubnetSpec>) -> NetworkRequestSpec {
        NetworkRequestSpec {
            network: NetworkSpec {
                cidr: network.to_string(),
            },
            subnets,
        }
    }

    #[test]
    fn accepts_well_formed_spec() {
        let spec = spec(
            "10.0.0.0/16",
            vec![
                subnet("10.0.1.0/24", "eu-west-1a"),
                subnet("10.0.2.0/24", "eu-west-1b"),
            ],
        );

        spec.validate().expect("spec should be valid");
    }

    #[test]
    fn rejects_unparseable_network_cidr() {
        let spec = spec("not-a-cidr", vec![subnet("10.0.1.0/24", "eu-west-1a")]);

        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("Invalid network CIDR"));
    }

    #[test]
    fn rejects_network_cidr_with_host_bits() {
        let spec = spec("10.0.0.1/16", vec![subnet("10.0.1.0/24", "eu-west-1a")]);

        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("host bits"));
    }

    #[test]
    fn rejects_empty_subnet_list() {
        let err = spec("10.0.0.0/16", vec![]).validate().unwrap_err();

        assert!(err.message.contains("subnets"));
    }

    #[test]
    fn rejects_too_many_subnets() {
        let subnets: Vec<SubnetSpec> = (0..11)
            .map(|i| subnet(&format!("10.0.{i}.0/24"), "eu-west-1a"))
            .collect();

        let err = spec("10.0.0.0/16", subnets).validate().unwrap_err();
        assert!(err.message.contains("Too many subnets"));
    }

    #[test]
    fn rejects_subnet_outside_network_range() {
        let spec = spec("10.0.0.0/16", vec![subnet("192.168.1.0/24", "eu-west-1a")]);

        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("not within network CIDR"));
    }

    #[test]
    fn rejects_overlapping_subnets() {
        let spec = spec(
            "10.0.0.0/16",
            vec![
                subnet("10.0.0.0/23", "eu-west-1a"),
                subnet("10.0.1.0/24", "eu-west-1b"),
            ],
        );

        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("overlaps"));
    }

    #[test]
    fn rejects_missing_az() {
        let spec = spec("10.0.0.0/16", vec![subnet("10.0.1.0/24", "")]);

        let err = spec.validate().unwrap_err();
        assert!(err.message.contains("missing 'az'"));
    }
}
