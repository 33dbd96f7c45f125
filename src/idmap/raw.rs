//! `raw.idmap` parsing and the host-ownership safety check.

use crate::error::{CoreError, CoreResult};

use super::types::{IdEntry, IdKind};

/// The reserved slice of the delegated range that scanning never hands out
/// (scanning starts at `initial_base + 65536`). Raw entries that land
/// inside it claim host ids the daemon itself relies on, not a
/// sub-delegated id, so they are rejected.
const RESERVED_HEAD: u32 = 65536;

/// Parse a `raw.idmap` string (one entry per line, `kind nsid hostid
/// maprange`) and reject entries whose host range overlaps the reserved
/// head of the delegated range.
pub fn parse_and_check(raw: &str, initial_base: u32) -> CoreResult<Vec<IdEntry>> {
    let reserved_end = initial_base.saturating_add(RESERVED_HEAD);
    let mut entries = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [kind, nsid, hostid, maprange] = fields[..] else {
            return Err(CoreError::InvalidConfig(format!(
                "malformed raw.idmap entry: {line}"
            )));
        };

        let kind = match kind {
            "uid" => IdKind::Uid,
            "gid" => IdKind::Gid,
            "both" => {
                // A `both` line maps the same range for uid and gid; expand
                // it into the two underlying entries so downstream code
                // only ever deals with `IdKind::Uid`/`IdKind::Gid`.
                let nsid: u32 = parse_field(nsid, line)?;
                let hostid: u32 = parse_field(hostid, line)?;
                let maprange: u32 = parse_field(maprange, line)?;
                check_reserved(hostid, maprange, initial_base, reserved_end, line)?;
                entries.push(IdEntry { kind: IdKind::Uid, nsid, hostid, maprange });
                entries.push(IdEntry { kind: IdKind::Gid, nsid, hostid, maprange });
                continue;
            }
            other => {
                return Err(CoreError::InvalidConfig(format!(
                    "unknown raw.idmap entry kind {other:?} in {line:?}"
                )));
            }
        };

        let nsid: u32 = parse_field(nsid, line)?;
        let hostid: u32 = parse_field(hostid, line)?;
        let maprange: u32 = parse_field(maprange, line)?;
        check_reserved(hostid, maprange, initial_base, reserved_end, line)?;

        entries.push(IdEntry { kind, nsid, hostid, maprange });
    }

    Ok(entries)
}

fn parse_field(field: &str, line: &str) -> CoreResult<u32> {
    field
        .parse()
        .map_err(|_| CoreError::InvalidConfig(format!("malformed raw.idmap entry: {line}")))
}

fn check_reserved(
    hostid: u32,
    maprange: u32,
    initial_base: u32,
    reserved_end: u32,
    line: &str,
) -> CoreResult<()> {
    let end = hostid.saturating_add(maprange);
    let overlaps = hostid < reserved_end && end > initial_base;
    if overlaps {
        return Err(CoreError::HostIdIsSubId(line.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uid_and_gid_lines() {
        let entries = parse_and_check("uid 0 1165536 1000\ngid 0 1165536 1000", 1000000).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, IdKind::Uid);
        assert_eq!(entries[0].hostid, 1165536);
    }

    #[test]
    fn expands_both_lines() {
        let entries = parse_and_check("both 0 1165536 1000", 1000000).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, IdKind::Uid);
        assert_eq!(entries[1].kind, IdKind::Gid);
    }

    #[test]
    fn rejects_entries_inside_reserved_head() {
        // initial_base=1000000, reserved head is [1000000, 1065536).
        let err = parse_and_check("uid 0 1000000 100", 1000000).unwrap_err();
        assert!(matches!(err, CoreError::HostIdIsSubId(_)));
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let entries = parse_and_check("\n# comment\nuid 0 1165536 10\n", 1000000).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rejects_malformed_line() {
        let err = parse_and_check("uid 0 1165536", 1000000).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }
}
