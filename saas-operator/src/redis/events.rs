//! Sentinel event decoding.
//!
//! Sentinels publish a notification for each state change they observe on a channel named after
//! the event, e.g. `+sdown`. The payload is a space separated list of fields whose shape depends
//! on the event. Most events use the instance details format:
//!
//! ```text
//! <instance-type> <name> <ip> <port> @ <master-name> <master-ip> <master-port>
//! ```
//!
//! where the part after `@` is omitted when the instance is itself a master.

use crate::error::DecodeError;

/// The details of a server as given by a Sentinel event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDetails {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub role: String,
}

/// A config name/value pair carried by a Sentinel event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigParam {
    pub name: String,
    pub value: String,
}

/// A decoded Sentinel event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisEventMessage {
    pub event: String,
    /// The instance the event is about.
    pub target: Option<InstanceDetails>,
    /// The master of the shard the target belongs to.
    pub master: Option<InstanceDetails>,
    pub config: Option<ConfigParam>,
}

impl RedisEventMessage {
    /// Decode a Sentinel notification.
    pub fn decode(topic: &str, payload: &str) -> Result<Self, DecodeError> {
        let fields: Vec<&str> = payload.split_whitespace().collect();
        let field_count = |expected: &'static str| DecodeError::FieldCount {
            topic: topic.into(),
            payload: payload.into(),
            expected,
            got: fields.len(),
        };
        let mut msg = Self { event: topic.into(), target: None, master: None, config: None };

        match topic {
            "+tilt" | "-tilt" => {
                if !fields.is_empty() {
                    return Err(DecodeError::UnexpectedPayload { topic: topic.into(), payload: payload.into() });
                }
            }
            "+switch-master" => {
                // <name> <old-ip> <old-port> <new-ip> <new-port>
                if fields.len() != 5 {
                    return Err(field_count("5"));
                }
                msg.target = Some(instance("master", fields[0], fields[1], fields[2])?);
                msg.master = Some(instance("master", fields[0], fields[3], fields[4])?);
            }
            "+set" | "+monitor" => {
                // <role> <name> <ip> <port> <key> <value>
                if fields.len() != 6 {
                    return Err(field_count("6"));
                }
                let target = instance(fields[0], fields[1], fields[2], fields[3])?;
                let name = if topic == "+monitor" { "quorum" } else { fields[4] };
                msg.config = Some(ConfigParam { name: name.into(), value: fields[5].into() });
                msg.master = Some(target.clone());
                msg.target = Some(target);
            }
            "+new-epoch" => {
                if fields.len() != 1 {
                    return Err(field_count("1"));
                }
                msg.config = Some(ConfigParam { name: "epoch".into(), value: fields[0].into() });
            }
            "+vote-for-leader" => {
                // <runid> <epoch>
                if fields.len() != 2 {
                    return Err(field_count("2"));
                }
                msg.config = Some(ConfigParam { name: fields[0].into(), value: fields[1].into() });
            }
            _ => {
                if fields.len() < 4 {
                    return Err(field_count("at least 4"));
                }
                let target = instance(fields[0], fields[1], fields[2], fields[3])?;
                if target.role == "master" {
                    // Trailing tokens, such as the `#quorum 2/2` of `+odown`, carry no instance details.
                    msg.master = Some(target.clone());
                } else {
                    if fields.len() < 8 || fields[4] != "@" {
                        return Err(DecodeError::MissingMaster { topic: topic.into(), payload: payload.into(), role: target.role });
                    }
                    msg.master = Some(instance("master", fields[5], fields[6], fields[7])?);
                }
                msg.target = Some(target);
            }
        }
        Ok(msg)
    }

    /// Whether this event reflects a change of the topology of the monitored shards.
    pub fn is_topology_change(&self) -> bool {
        matches!(
            self.event.as_str(),
            "+switch-master"
                | "+sdown"
                | "-sdown"
                | "+odown"
                | "-odown"
                | "+slave"
                | "+sentinel"
                | "-dup-sentinel"
                | "+reset-master"
                | "+convert-to-slave"
                | "+failover-end"
                | "+monitor"
        )
    }
}

fn instance(role: &str, name: &str, ip: &str, port: &str) -> Result<InstanceDetails, DecodeError> {
    let port = port.parse().map_err(|_| DecodeError::InvalidPort(port.into()))?;
    Ok(InstanceDetails { name: name.into(), ip: ip.into(), port, role: role.into() })
}
