use std::collections::BTreeMap;
use std::ffi::CStr;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use aegis_common::{ConnectEvent, ExecEvent, FileOpenEvent, AF_INET};
use anyhow::Context;
use aya::maps::{HashMap, MapData, RingBuf};
use aya::Ebpf;
use log::{debug, error};
use prettytable::{color, row, Attr, Cell, Row, Table};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::unix::AsyncFd;
use users::{Groups, Users, UsersCache};

use crate::policy::CompiledPolicy;
use crate::record::Record;

/// Parent links followed when rendering an exec's ancestry.
const MAX_CHAIN: usize = 8;

/// Converts boot-relative timestamps into wall-clock time.
#[derive(Clone, Copy, Debug)]
pub struct BootClock {
    boot_unix_ns: i128,
}

impl BootClock {
    pub fn read() -> anyhow::Result<Self> {
        let uptime = std::fs::read_to_string("/proc/uptime").context("failed to read /proc/uptime")?;
        Self::from_uptime(&uptime, OffsetDateTime::now_utc())
    }

    pub fn from_uptime(uptime: &str, now: OffsetDateTime) -> anyhow::Result<Self> {
        let seconds: f64 = uptime
            .split_whitespace()
            .next()
            .context("empty uptime")?
            .parse()
            .context("malformed uptime")?;
        Ok(Self {
            boot_unix_ns: now.unix_timestamp_nanos() - (seconds * 1e9) as i128,
        })
    }

    pub fn wall(&self, timestamp_ns: u64) -> String {
        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );
        OffsetDateTime::from_unix_timestamp_nanos(self.boot_unix_ns + timestamp_ns as i128)
            .ok()
            .and_then(|t| t.format(&format).ok())
            .unwrap_or_else(|| format!("+{}ns", timestamp_ns))
    }
}

/// `ppid`, its parent, and so on, until the chain leaves the table, reaches
/// init or loops.
pub fn ancestry_chain(ppid: u32, lookup: impl Fn(u32) -> Option<u32>) -> Vec<u32> {
    let mut chain = vec![ppid];
    let mut pid = ppid;
    while chain.len() < MAX_CHAIN && pid > 1 {
        match lookup(pid) {
            Some(parent) if !chain.contains(&parent) => {
                chain.push(parent);
                pid = parent;
            }
            _ => break,
        }
    }
    chain
}

fn text(buf: &[u8]) -> &str {
    CStr::from_bytes_until_nul(buf)
        .ok()
        .and_then(|s| s.to_str().ok())
        .unwrap_or("Unknown")
}

pub fn exec_detail(event: &ExecEvent, chain: &[u32]) -> String {
    let chain = chain.iter().map(|pid| pid.to_string()).collect::<Vec<_>>().join(" <- ");
    format!(
        "parent {}/{} [{}]\n{}\n{}",
        event.ppid,
        text(&event.pcomm),
        chain,
        text(&event.filename),
        text(&event.command_line)
    )
}

pub fn file_detail(event: &FileOpenEvent) -> String {
    format!(
        "{}/{} flags {:#o}\n{}",
        event.dev,
        event.ino,
        event.flags,
        text(&event.filename)
    )
}

pub fn connect_detail(event: &ConnectEvent) -> String {
    match event.family {
        AF_INET => format!("{}:{}", Ipv4Addr::from(event.addr_v4), event.port),
        _ => format!("[{}]:{}", Ipv6Addr::from(event.addr_v6), event.port),
    }
}

/// Where user and group names come from.
pub trait NameSource {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

impl<U: Users + Groups> NameSource for U {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.get_user_by_uid(uid).map(|u| u.name().to_string_lossy().into_owned())
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.get_group_by_gid(gid).map(|g| g.name().to_string_lossy().into_owned())
    }
}

/// Rendered owner names, resolved once per id. Unknown ids are remembered
/// as their number.
pub struct OwnerNames<S> {
    source: S,
    users: BTreeMap<u32, String>,
    groups: BTreeMap<u32, String>,
}

impl<S: NameSource> OwnerNames<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            users: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn user(&mut self, uid: u32) -> &str {
        let source = &self.source;
        self.users
            .entry(uid)
            .or_insert_with(|| source.user_name(uid).unwrap_or_else(|| uid.to_string()))
    }

    pub fn group(&mut self, gid: u32) -> &str {
        let source = &self.source;
        self.groups
            .entry(gid)
            .or_insert_with(|| source.group_name(gid).unwrap_or_else(|| gid.to_string()))
    }
}

/// Names of the rules an event matched, one per line.
pub fn rule_column(record: &Record, policy: &CompiledPolicy) -> String {
    let mut lines = Vec::new();
    match record {
        Record::Exec(e) => {
            lines.extend(policy.path_label(text(&e.filename)).map(ToString::to_string));
            lines.extend(policy.rules.exec_alerts(e).iter().map(ToString::to_string));
        }
        Record::FileOpen(e) => {
            lines.extend(policy.path_label(text(&e.filename)).map(ToString::to_string));
        }
        Record::Connect(e) => {
            lines.extend(policy.port_label(e.port).map(ToString::to_string));
            lines.extend(policy.rules.connect_alerts(e).iter().map(ToString::to_string));
        }
    }
    match lines.is_empty() {
        true => "-".to_string(),
        false => lines.join("\n"),
    }
}

/// State the drain task renders events with.
struct Printer {
    ancestry: HashMap<MapData, u32, u32>,
    clock: BootClock,
    owners: OwnerNames<UsersCache>,
    policy: CompiledPolicy,
}

impl Printer {
    fn print(&mut self, record: &Record) {
        let header = record.header();
        let detail = match record {
            Record::Exec(e) => {
                let chain = ancestry_chain(e.ppid, |pid| self.ancestry.get(&pid, 0).ok());
                exec_detail(e, &chain)
            }
            Record::FileOpen(e) => file_detail(e),
            Record::Connect(e) => connect_detail(e),
        };
        let rule = rule_column(record, &self.policy);
        let user_name = self.owners.user(header.uid).to_string();
        let group_name = self.owners.group(header.gid).to_string();
        let kind = header.event_type().map_or("unknown".to_string(), |k| k.to_string());

        let mut table = Table::new();
        table.set_titles(row!["time", "action", "kind", "rule", "user", "group", "process", "detail"]);
        table.add_row(Row::new(vec![
            Cell::new(&self.clock.wall(header.timestamp_ns))
                .with_style(Attr::ForegroundColor(color::BLUE)),
            match header.is_blocked() {
                true => Cell::new("Denied").with_style(Attr::ForegroundColor(color::RED)),
                false => Cell::new("Allowed").with_style(Attr::ForegroundColor(color::GREEN)),
            },
            Cell::new(&kind).with_style(Attr::ForegroundColor(color::BRIGHT_CYAN)),
            Cell::new(&rule).with_style(Attr::ForegroundColor(color::BRIGHT_MAGENTA)),
            Cell::new(user_name.as_str()).with_style(Attr::ForegroundColor(color::BRIGHT_YELLOW)),
            Cell::new(group_name.as_str()).with_style(Attr::ForegroundColor(color::BRIGHT_YELLOW)),
            Cell::new(&format!("{}/{}", header, text(&header.comm)))
                .with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
            Cell::new(&detail).with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
        ]));
        {
            //prevent interleaving with log output
            let _stdout = io::stdout().lock();
            if let Err(err) = table.print_tty(true) {
                error!("failed to print event: {}", err);
            }
        }
    }
}

/// Drains `EVENTS` on a background task until the runtime shuts down.
pub fn wait_events(bpf: &mut Ebpf, policy: CompiledPolicy) -> anyhow::Result<()> {
    let ring = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let ancestry: HashMap<MapData, u32, u32> =
        HashMap::try_from(bpf.take_map("PID_TO_PPID").context("PID_TO_PPID map not found")?)?;
    let mut printer = Printer {
        ancestry,
        clock: BootClock::read()?,
        owners: OwnerNames::new(UsersCache::new()),
        policy,
    };
    let mut events = AsyncFd::new(ring).context("failed to poll EVENTS")?;

    tokio::task::spawn(async move {
        loop {
            let mut guard = match events.readable_mut().await {
                Ok(guard) => guard,
                Err(err) => {
                    error!("failed to wait for events: {}", err);
                    break;
                }
            };
            let ring = guard.get_inner_mut();
            let mut read = 0usize;
            while let Some(item) = ring.next() {
                read += 1;
                match Record::decode(&item) {
                    Ok(record) => printer.print(&record),
                    Err(err) => error!("failed to decode event: {}", err),
                }
            }
            debug!("fetched {} entries", read);
            guard.clear_ready();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::{EventHeader, EventType, TaskContext, AF_INET6};
    use std::cell::Cell;
    use std::collections::HashMap as StdMap;
    use time::Duration;
    use users::mock::{Group, MockUsers, User};

    use crate::policy::PolicyFile;

    fn header(kind: EventType) -> EventHeader {
        EventHeader::new(kind, &TaskContext::default(), false)
    }

    fn fill(dst: &mut [u8], src: &str) {
        dst[..src.len()].copy_from_slice(src.as_bytes());
    }

    #[test]
    fn chain_follows_parents_until_init() {
        let table: StdMap<u32, u32> = [(300, 200), (200, 1), (1, 0)].into_iter().collect();
        assert_eq!(ancestry_chain(300, |p| table.get(&p).copied()), vec![300, 200, 1]);
    }

    #[test]
    fn chain_stops_on_loops_and_missing_entries() {
        let table: StdMap<u32, u32> = [(10, 11), (11, 10)].into_iter().collect();
        assert_eq!(ancestry_chain(10, |p| table.get(&p).copied()), vec![10, 11]);
        assert_eq!(ancestry_chain(55, |_| None), vec![55]);
    }

    #[test]
    fn chain_is_bounded() {
        let chain = ancestry_chain(1000, |p| Some(p + 1));
        assert_eq!(chain.len(), MAX_CHAIN);
    }

    #[test]
    fn clock_converts_boot_relative_time() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_100).unwrap();
        let clock = BootClock::from_uptime("100.00 250.00\n", now).unwrap();
        let boot = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let expected = boot + Duration::milliseconds(1_500);
        assert_eq!(clock.wall(1_500_000_000), format!(
            "{}-{:02}-{:02} {:02}:{:02}:{:02}.500",
            expected.year(),
            u8::from(expected.month()),
            expected.day(),
            expected.hour(),
            expected.minute(),
            expected.second()
        ));
        assert!(BootClock::from_uptime("", now).is_err());
        assert!(BootClock::from_uptime("abc", now).is_err());
    }

    #[test]
    fn connect_detail_formats_both_families() {
        let mut event = ConnectEvent {
            header: header(EventType::Connect),
            addr_v4: [192, 168, 1, 20],
            family: AF_INET,
            port: 4444,
            addr_v6: [0; 16],
        };
        assert_eq!(connect_detail(&event), "192.168.1.20:4444");
        event.family = AF_INET6;
        event.addr_v4 = [0; 4];
        event.addr_v6[15] = 1;
        assert_eq!(connect_detail(&event), "[::1]:4444");
    }

    #[test]
    fn exec_detail_lists_chain_and_command_line() {
        let mut event = ExecEvent {
            header: header(EventType::Exec),
            ppid: 200,
            _pad: [0; 4],
            pcomm: [0; 16],
            filename: [0; 256],
            command_line: [0; 512],
        };
        fill(&mut event.pcomm, "bash");
        fill(&mut event.filename, "/bin/ls");
        fill(&mut event.command_line, "ls -la");
        assert_eq!(
            exec_detail(&event, &[200, 1]),
            "parent 200/bash [200 <- 1]\n/bin/ls\nls -la"
        );
    }

    /// Counts how often names are resolved from the system databases.
    struct CountingNames {
        users: MockUsers,
        lookups: Cell<usize>,
    }

    impl NameSource for CountingNames {
        fn user_name(&self, uid: u32) -> Option<String> {
            self.lookups.set(self.lookups.get() + 1);
            self.users.user_name(uid)
        }

        fn group_name(&self, gid: u32) -> Option<String> {
            self.lookups.set(self.lookups.get() + 1);
            self.users.group_name(gid)
        }
    }

    #[test]
    fn owner_names_resolve_each_id_once() {
        let mut users = MockUsers::with_current_uid(0);
        users.add_user(User::new(1000, "alice", 1000));
        users.add_group(Group::new(1000, "staff"));
        let mut owners = OwnerNames::new(CountingNames {
            users,
            lookups: Cell::new(0),
        });

        for _ in 0..3 {
            assert_eq!(owners.user(1000), "alice");
            assert_eq!(owners.group(1000), "staff");
        }
        assert_eq!(owners.source.lookups.get(), 2);

        for _ in 0..3 {
            assert_eq!(owners.user(4242), "4242");
        }
        assert_eq!(owners.source.lookups.get(), 3);
    }

    #[test]
    fn rule_column_names_matching_rules() {
        let policy = PolicyFile::from_toml_str(
            r#"
            [[path]]
            name = "credentials"
            severity = "high"
            path = "/etc/"
            action = "block"

            [[port]]
            port = 4444
            action = "monitor"

            [[connect]]
            name = "loopback"
            severity = "info"
            action = "alert"
            dest_ip = "127.0.0.0/8"
            "#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let mut file = FileOpenEvent {
            header: header(EventType::FileOpen),
            ino: 1,
            dev: 1,
            flags: 0,
            _pad: [0; 4],
            filename: [0; 256],
        };
        fill(&mut file.filename, "/etc/passwd");
        assert_eq!(rule_column(&Record::FileOpen(file), &policy), "credentials (high)");
        file.filename = [0; 256];
        fill(&mut file.filename, "/tmp/x");
        assert_eq!(rule_column(&Record::FileOpen(file), &policy), "-");

        let connect = ConnectEvent {
            header: header(EventType::Connect),
            addr_v4: [127, 0, 0, 1],
            family: AF_INET,
            port: 4444,
            addr_v6: [0; 16],
        };
        assert_eq!(
            rule_column(&Record::Connect(connect), &policy),
            "port 4444 (medium)\nloopback (info)"
        );
    }

    #[test]
    fn file_detail_shows_ids_and_flags() {
        let mut event = FileOpenEvent {
            header: header(EventType::FileOpen),
            ino: 12,
            dev: 2049,
            flags: 0o2,
            _pad: [0; 4],
            filename: [0; 256],
        };
        fill(&mut event.filename, "/etc/shadow");
        assert_eq!(file_detail(&event), "2049/12 flags 0o2\n/etc/shadow");
    }
}
