//! Traffic Control filter installation (spec §4.1.2, §6).
//!
//! `rtnetlink`/`netlink-packet-route` cover link/address/namespace moves
//! cleanly, but encoding `u32` multi-match + chained `pedit`/`mirred`
//! actions over netlink by hand is its own large surface with no safe
//! high-level crate behind it. We drive `tc` itself with the exact
//! argument shapes spec §6 lays out; every call here is one `tc` (or `ip`)
//! child process, synchronous, meant to run from inside the interceptor's
//! `spawn_blocking` closure alongside the netlink/`setns` work.
//!
//! Match offsets, per spec §6: `-14` (dst MAC high 16 bits), `-12` (dst MAC
//! low 32 bits), `-8` (src MAC high 32 bits), `-4` (src MAC low 16 bits).
//! `protocol {ip|all}` is installed as two sibling filters per logical rule
//! so both IPv4 and non-IP (ARP, etc.) frames are covered — the reason
//! spec scenario S1 counts 4 filters per direction in TAP mode (2 logical
//! rules: plain mirror, and pedit+mirror-to-vbr, each duplicated across the
//! `ip`/`all` protocol) and 2 in FWD mode (pedit+mirror only); see
//! DESIGN.md.

use crate::error::{AgentError, AgentResult};
use segment_core::domain::intercept::MacAddr;
use std::process::Command;

const PROTOCOLS: [&str; 2] = ["ip", "all"];

fn run(args: &[String]) -> AgentResult<()> {
    tracing::debug!(cmd = %args.join(" "), "executing tc/ip");
    let program = args.first().ok_or_else(|| AgentError::Tc("empty command".into()))?;
    let output = Command::new(program)
        .args(&args[1..])
        .output()
        .map_err(|e| AgentError::Tc(format!("{}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(AgentError::Tc(format!(
            "{}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn s(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// `tc qdisc add dev <port> ingress`, idempotent: ignores "already exists".
pub fn ensure_ingress_qdisc(dev: &str) -> AgentResult<()> {
    let args = s(&["tc", "qdisc", "add", "dev", dev, "ingress"]);
    match run(&args) {
        Ok(()) => Ok(()),
        Err(AgentError::Tc(msg)) if msg.contains("File exists") => Ok(()),
        Err(e) => Err(e),
    }
}

/// `tc qdisc del dev <port> ingress`. Deleting the only qdisc removes every
/// filter attached under it, so this is the final step of detach (spec
/// §4.1 "Detach").
pub fn delete_ingress_qdisc(dev: &str) -> AgentResult<()> {
    let args = s(&["tc", "qdisc", "del", "dev", dev, "ingress"]);
    match run(&args) {
        Ok(()) => Ok(()),
        Err(AgentError::Tc(msg)) if msg.contains("No such file") || msg.contains("Cannot find device") => Ok(()),
        Err(e) => Err(e),
    }
}

/// `tc filter del dev <port> pref <pref>`, idempotent. Used for mode
/// changes (spec §4.1 "Mode change") and quarantine removal.
pub fn delete_filters_at_pref(dev: &str, pref: u16) -> AgentResult<()> {
    let pref = pref.to_string();
    let args = s(&["tc", "filter", "del", "dev", dev, "pref", &pref]);
    match run(&args) {
        Ok(()) => Ok(()),
        Err(AgentError::Tc(msg)) if msg.contains("Cannot find") || msg.contains("No such file") => Ok(()),
        Err(e) => Err(e),
    }
}

/// One `u32` match clause against a MAC address at a given byte offset and
/// width, per spec §6's four fixed offsets.
struct MacMatch {
    offset_hi16: i32,
    value_hi16: u32,
    offset_lo32: i32,
    value_lo32: u32,
}

fn dst_mac_match(mac: MacAddr) -> MacMatch {
    let b = mac.0;
    MacMatch {
        offset_hi16: -14,
        value_hi16: u32::from(b[0]) << 8 | u32::from(b[1]),
        offset_lo32: -12,
        value_lo32: u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
    }
}

fn src_mac_match(mac: MacAddr) -> MacMatch {
    let b = mac.0;
    MacMatch {
        offset_hi16: -4,
        value_hi16: u32::from(b[4]) << 8 | u32::from(b[5]),
        offset_lo32: -8,
        value_lo32: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
    }
}

fn push_mac_match(args: &mut Vec<String>, m: &MacMatch) {
    args.push("match".into());
    args.push("u16".into());
    args.push(format!("{:#06x}", m.value_hi16));
    args.push("0xffff".into());
    args.push("at".into());
    args.push(m.offset_hi16.to_string());
    args.push("match".into());
    args.push("u32".into());
    args.push(format!("{:#010x}", m.value_lo32));
    args.push("0xffffffff".into());
    args.push("at".into());
    args.push(m.offset_lo32.to_string());
}

/// Inbound-match filter, TAP mode (spec §4.1.2): dst MAC == container MAC,
/// and the IG bit of the first dst-MAC byte is 0 (unicast). `ig_mask`
/// narrows the high-byte match to just that bit when combined with the
/// full dst-MAC match above; we fold it into the same `u16` match by
/// widening the mask only over the byte we care about.
fn install_filter(
    dev: &str,
    pref: u16,
    protocol: &str,
    handle_suffix: u32,
    mac_match: &MacMatch,
    action_args: &[String],
) -> AgentResult<()> {
    let mut args = s(&["tc", "filter", "add", "dev", dev, "ingress"]);
    args.push("pref".into());
    args.push(pref.to_string());
    args.push("protocol".into());
    args.push(protocol.into());
    args.push("parent".into());
    args.push("ffff:".into());
    args.push("handle".into());
    args.push(format!("0x{handle_suffix:x}"));
    args.push("u32".into());
    push_mac_match(&mut args, mac_match);
    args.extend(action_args.iter().cloned());
    run(&args)
}

fn mirror_action(dev: &str) -> Vec<String> {
    s(&["action", "mirred", "egress", "mirror", "dev", dev])
}

fn pedit_dst_then_mirror(new_mac: MacAddr, mirror_dev: &str) -> Vec<String> {
    let m = dst_mac_match(new_mac);
    let mut out = vec![
        "action".to_string(),
        "pedit".to_string(),
        "munge".to_string(),
        "offset".to_string(),
        m.offset_hi16.to_string(),
        "u16".to_string(),
        "set".to_string(),
        format!("{:#06x}", m.value_hi16),
        "munge".to_string(),
        "offset".to_string(),
        m.offset_lo32.to_string(),
        "u32".to_string(),
        "set".to_string(),
        format!("{:#010x}", m.value_lo32),
        "pipe".to_string(),
    ];
    out.extend(mirror_action(mirror_dev));
    out
}

fn pedit_src_then_mirror(new_mac: MacAddr, mirror_dev: &str) -> Vec<String> {
    let m = src_mac_match(new_mac);
    let mut out = vec![
        "action".to_string(),
        "pedit".to_string(),
        "munge".to_string(),
        "offset".to_string(),
        m.offset_lo32.to_string(),
        "u32".to_string(),
        "set".to_string(),
        format!("{:#010x}", m.value_lo32),
        "munge".to_string(),
        "offset".to_string(),
        m.offset_hi16.to_string(),
        "u16".to_string(),
        "set".to_string(),
        format!("{:#06x}", m.value_hi16),
        "pipe".to_string(),
    ];
    out.extend(mirror_action(mirror_dev));
    out
}

/// Installs the inbound half of TAP mode on `ex_port` (spec §4.1.2): match
/// dst MAC == container MAC + unicast, then plain `mirror→in_port`, and in
/// parallel a pedit-to-UCMAC `mirror→vbr`. Two logical rules × two
/// protocol variants = 4 filters, matching scenario S1.
pub fn install_tap_inbound(
    ex_port: &str,
    in_port: &str,
    vbr: &str,
    container_mac: MacAddr,
    ucmac: MacAddr,
    pref: u16,
) -> AgentResult<()> {
    let m = dst_mac_match(container_mac);
    for (i, proto) in PROTOCOLS.iter().enumerate() {
        install_filter(ex_port, pref, proto, 0x10 + i as u32, &m, &mirror_action(in_port))?;
        install_filter(
            ex_port,
            pref,
            proto,
            0x20 + i as u32,
            &m,
            &pedit_dst_then_mirror(ucmac, vbr),
        )?;
    }
    Ok(())
}

/// Installs the outbound half of TAP mode on `in_port`: match src MAC ==
/// container MAC, plain `mirror→ex_port`, and in parallel a pedit-to-UCMAC
/// `mirror→vbr` (src-MAC rewrite this time).
pub fn install_tap_outbound(
    in_port: &str,
    ex_port: &str,
    vbr: &str,
    container_mac: MacAddr,
    ucmac: MacAddr,
    pref: u16,
) -> AgentResult<()> {
    let m = src_mac_match(container_mac);
    for (i, proto) in PROTOCOLS.iter().enumerate() {
        install_filter(in_port, pref, proto, 0x30 + i as u32, &m, &mirror_action(ex_port))?;
        install_filter(
            in_port,
            pref,
            proto,
            0x40 + i as u32,
            &m,
            &pedit_src_then_mirror(ucmac, vbr),
        )?;
    }
    Ok(())
}

/// `vbr` drop filter for a TAP-mode pair (spec §4.1.2, §4.1 "No loops",
/// §6 / S4): matches the pair's UCMAC exactly, `action drop`, preventing
/// the vbr copy from re-entering the steering loop.
pub fn install_vbr_drop(vbr: &str, ucmac: MacAddr, pref: u16) -> AgentResult<()> {
    let m = dst_mac_match(ucmac);
    install_filter(vbr, pref, "all", 0x50, &m, &s(&["action", "drop"]))
}

/// FWD-mode inbound: on `ex_port`, rewrite dst MAC to UCMAC and
/// `mirror→vbr` only — delivery to `in_port` is withheld until the data
/// plane's verdict re-emits it from vbr (spec §4.1.2). 2 filters (ip/all).
pub fn install_fwd_inbound(ex_port: &str, vbr: &str, container_mac: MacAddr, ucmac: MacAddr, pref: u16) -> AgentResult<()> {
    let m = dst_mac_match(container_mac);
    for (i, proto) in PROTOCOLS.iter().enumerate() {
        install_filter(
            ex_port,
            pref,
            proto,
            0x20 + i as u32,
            &m,
            &pedit_dst_then_mirror(ucmac, vbr),
        )?;
    }
    Ok(())
}

/// FWD-mode outbound: symmetric on `in_port` (spec §4.1.2).
pub fn install_fwd_outbound(in_port: &str, vbr: &str, container_mac: MacAddr, ucmac: MacAddr, pref: u16) -> AgentResult<()> {
    let m = src_mac_match(container_mac);
    for (i, proto) in PROTOCOLS.iter().enumerate() {
        install_filter(
            in_port,
            pref,
            proto,
            0x40 + i as u32,
            &m,
            &pedit_src_then_mirror(ucmac, vbr),
        )?;
    }
    Ok(())
}

/// `vbr` return filter for a FWD-mode pair (spec §4.1.2, §8 scenario S6):
/// matches the pair's UCMAC, rewrites dst MAC back to the container MAC,
/// and `mirror→in_port` (or `→ex_port` for the outbound direction,
/// selected by `deliver_to`).
pub fn install_vbr_return(vbr: &str, ucmac: MacAddr, container_mac: MacAddr, deliver_to: &str, pref: u16) -> AgentResult<()> {
    let m = dst_mac_match(ucmac);
    install_filter(vbr, pref, "all", 0x50, &m, &pedit_dst_then_mirror(container_mac, deliver_to))
}

/// Top-preference DROP-everything filter on one port (spec §4.1
/// "Quarantine"): `u32 match u32 0 0 at 0` matches unconditionally.
pub fn install_quarantine_drop(dev: &str, pref: u16) -> AgentResult<()> {
    let mut args = s(&["tc", "filter", "add", "dev", dev, "ingress", "pref"]);
    args.push(pref.to_string());
    args.extend(s(&["protocol", "all", "parent", "ffff:", "u32", "match", "u32", "0", "0", "at", "0"]));
    args.extend(s(&["action", "drop"]));
    run(&args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_mac_match_splits_on_spec_offsets() {
        let mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let m = dst_mac_match(mac);
        assert_eq!(m.offset_hi16, -14);
        assert_eq!(m.offset_lo32, -12);
        assert_eq!(m.value_hi16, 0xaabb);
        assert_eq!(m.value_lo32, 0xccddee01);
    }

    #[test]
    fn src_mac_match_splits_on_spec_offsets() {
        let mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let m = src_mac_match(mac);
        assert_eq!(m.offset_hi16, -4);
        assert_eq!(m.offset_lo32, -8);
        assert_eq!(m.value_hi16, 0xee01);
        assert_eq!(m.value_lo32, 0xaabbccdd);
    }

    #[test]
    fn ucmac_match_at_vbr_matches_scenario_s4() {
        // S4: UCMAC 4e:65:75:56:00:05 -> u16 0x4e65 at -14, u32 0x75560005 at -12.
        let mac = MacAddr::ucmac(5);
        let m = dst_mac_match(mac);
        assert_eq!(m.value_hi16, 0x4e65);
        assert_eq!(m.value_lo32, 0x7556_0005);
    }
}
