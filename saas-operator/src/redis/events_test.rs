use anyhow::Result;

use super::events::{ConfigParam, InstanceDetails, RedisEventMessage};
use crate::error::DecodeError;

fn inst(name: &str, ip: &str, port: u16, role: &str) -> InstanceDetails {
    InstanceDetails { name: name.into(), ip: ip.into(), port, role: role.into() }
}

#[test]
fn decode_switch_master() -> Result<()> {
    let msg = RedisEventMessage::decode("+switch-master", "shard01 10.244.0.36 6379 10.244.0.38 6379")?;

    let expected_target = inst("shard01", "10.244.0.36", 6379, "master");
    let expected_master = inst("shard01", "10.244.0.38", 6379, "master");
    assert_eq!(msg.target, Some(expected_target.clone()), "expected target {:?}, got {:?}", expected_target, msg.target);
    assert_eq!(msg.master, Some(expected_master.clone()), "expected master {:?}, got {:?}", expected_master, msg.master);
    assert!(msg.config.is_none(), "expected no config, got {:?}", msg.config);
    assert!(msg.is_topology_change(), "expected +switch-master to be a topology change");

    Ok(())
}

#[test]
fn decode_monitor() -> Result<()> {
    let msg = RedisEventMessage::decode("+monitor", "master shard01 10.244.0.24 6379 quorum 2")?;

    let expected = inst("shard01", "10.244.0.24", 6379, "master");
    let expected_config = ConfigParam { name: "quorum".into(), value: "2".into() };
    assert_eq!(msg.config, Some(expected_config.clone()), "expected config {:?}, got {:?}", expected_config, msg.config);
    assert_eq!(msg.target, Some(expected.clone()), "expected target {:?}, got {:?}", expected, msg.target);
    assert_eq!(msg.master, msg.target, "expected master to equal target, got {:?}", msg.master);

    Ok(())
}

#[test]
fn decode_monitor_without_quorum_fails() {
    let res = RedisEventMessage::decode("+monitor", "master shard01 10.244.0.24 6379");

    assert!(
        matches!(res, Err(DecodeError::FieldCount { got: 4, .. })),
        "expected field count error, got {:?}",
        res
    );
}

#[test]
fn decode_set() -> Result<()> {
    let msg = RedisEventMessage::decode("+set", "master shard01 10.244.0.24 6379 down-after-milliseconds 5000")?;

    let expected_config = ConfigParam { name: "down-after-milliseconds".into(), value: "5000".into() };
    assert_eq!(msg.config, Some(expected_config.clone()), "expected config {:?}, got {:?}", expected_config, msg.config);
    assert!(!msg.is_topology_change(), "expected +set not to be a topology change");

    Ok(())
}

#[test]
fn decode_master_instance_ignores_trailing_tokens() -> Result<()> {
    let msg = RedisEventMessage::decode("+odown", "master shard01 10.244.0.24 6379 #quorum 2/2")?;

    let expected = inst("shard01", "10.244.0.24", 6379, "master");
    assert_eq!(msg.target, Some(expected.clone()), "expected target {:?}, got {:?}", expected, msg.target);
    assert_eq!(msg.master, Some(expected.clone()), "expected master {:?}, got {:?}", expected, msg.master);

    Ok(())
}

#[test]
fn decode_replica_instance_resolves_master() -> Result<()> {
    let msg = RedisEventMessage::decode("+sdown", "slave 10.244.0.38:6379 10.244.0.38 6379 @ shard01 10.244.0.36 6379")?;

    let expected_target = inst("10.244.0.38:6379", "10.244.0.38", 6379, "slave");
    let expected_master = inst("shard01", "10.244.0.36", 6379, "master");
    assert_eq!(msg.target, Some(expected_target.clone()), "expected target {:?}, got {:?}", expected_target, msg.target);
    assert_eq!(msg.master, Some(expected_master.clone()), "expected master {:?}, got {:?}", expected_master, msg.master);

    Ok(())
}

#[test]
fn decode_replica_instance_without_master_fails() {
    let res = RedisEventMessage::decode("+sdown", "slave 10.244.0.38:6379 10.244.0.38 6379");

    assert!(matches!(res, Err(DecodeError::MissingMaster { .. })), "expected missing master error, got {:?}", res);
}

#[test]
fn decode_invalid_port_fails() {
    let res = RedisEventMessage::decode("+sdown", "master shard01 10.244.0.24 port");

    assert_eq!(res, Err(DecodeError::InvalidPort("port".into())), "expected invalid port error, got {:?}", res);
}

#[test]
fn decode_tilt_requires_empty_payload() -> Result<()> {
    let msg = RedisEventMessage::decode("+tilt", "")?;
    assert!(msg.target.is_none() && msg.master.is_none(), "expected no instance details, got {:?}", msg);

    let res = RedisEventMessage::decode("-tilt", "#tilt mode exited");
    assert!(matches!(res, Err(DecodeError::UnexpectedPayload { .. })), "expected unexpected payload error, got {:?}", res);

    Ok(())
}

#[test]
fn decode_bare_value_events() -> Result<()> {
    let epoch = RedisEventMessage::decode("+new-epoch", "7")?;
    let expected = ConfigParam { name: "epoch".into(), value: "7".into() };
    assert_eq!(epoch.config, Some(expected.clone()), "expected config {:?}, got {:?}", expected, epoch.config);

    let vote = RedisEventMessage::decode("+vote-for-leader", "a1b2c3 7")?;
    let expected = ConfigParam { name: "a1b2c3".into(), value: "7".into() };
    assert_eq!(vote.config, Some(expected.clone()), "expected config {:?}, got {:?}", expected, vote.config);
    assert!(vote.target.is_none(), "expected no target, got {:?}", vote.target);

    let res = RedisEventMessage::decode("+vote-for-leader", "a1b2c3");
    assert!(matches!(res, Err(DecodeError::FieldCount { got: 1, .. })), "expected field count error, got {:?}", res);

    Ok(())
}
