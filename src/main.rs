use std::{
    fs::File,
    io::{self, Write},
    net::Ipv4Addr,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use advmac::MacAddr6;
use arc_swap::ArcSwap;
use nodeaddr::{
    clock::{Clock, Instant, ManualClock, SystemClock},
    config::NodeConfig,
    journal::JournalSink,
    logging::{self, LogFormat},
    sim::{self, SimDhcpServer, SimNetwork},
    AddressCoordinator,
};
use tracing::{error, info, warn, Level};

const HELP: &str = "\
nodeaddr-sim: run the address coordinator against a simulated segment

USAGE:
  nodeaddr-sim [OPTIONS]

OPTIONS:
  --config <path>      node config (JSON), reloaded on SIGHUP
  --seed <n>           random seed, defaults to one derived from the MAC
  --seconds <n>        simulated run time [default: 120]
  --conflict <ip>      put a defending host on <ip>, repeatable
  --no-server          no DHCP server on the segment
  --flap-at <s>        drop the link at <s> and bring it back 5 s later
  --events <path|->    write the JSON event journal here
  --log-level <level>  trace, debug, info, warn, error [default: info]
  --json-logs          log as JSON
  --realtime           follow the wall clock instead of virtual time
  -h, --help           print this help
";

const STEP: Duration = Duration::from_millis(100);
const FLAP_DOWNTIME: Duration = Duration::from_secs(5);
const DEFAULT_HWADDR: MacAddr6 = MacAddr6::new([0x00, 0x50, 0xc2, 0x12, 0x34, 0x56]);

struct Args {
    config: Option<PathBuf>,
    seed: Option<u64>,
    seconds: u64,
    conflicts: Vec<Ipv4Addr>,
    no_server: bool,
    flap_at: Option<u64>,
    events: Option<String>,
    log_level: Level,
    json_logs: bool,
    realtime: bool,
}

fn parse_args() -> Result<Option<Args>, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(None);
    }

    let args = Args {
        config: pargs.opt_value_from_str("--config")?,
        seed: pargs.opt_value_from_str("--seed")?,
        seconds: pargs.opt_value_from_str("--seconds")?.unwrap_or(120),
        conflicts: pargs.values_from_str("--conflict")?,
        no_server: pargs.contains("--no-server"),
        flap_at: pargs.opt_value_from_str("--flap-at")?,
        events: pargs.opt_value_from_str("--events")?,
        log_level: pargs.opt_value_from_str("--log-level")?.unwrap_or(Level::INFO),
        json_logs: pargs.contains("--json-logs"),
        realtime: pargs.contains("--realtime"),
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("warning: unused arguments {remaining:?}");
    }
    Ok(Some(args))
}

/// Locally administered MAC for the `index`th `--conflict` host. There are
/// only 255 of them.
fn conflict_host_mac(index: usize) -> Option<MacAddr6> {
    let last = u8::try_from(index.checked_add(1)?).ok()?;
    Some(MacAddr6::new([0x02, 0x00, 0x00, 0x00, 0x00, last]))
}

fn open_journal(target: Option<&str>) -> io::Result<Box<dyn Write>> {
    Ok(match target {
        None => Box::new(io::sink()),
        Some("-") => Box::new(io::stdout()),
        Some(path) => Box::new(File::create(path)?),
    })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}\n\n{HELP}");
            return ExitCode::FAILURE;
        }
    };

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    logging::init_stdout(args.log_level, format);

    let node_config = match &args.config {
        Some(path) => match NodeConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(%e, path = %path.display(), "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => NodeConfig::new(DEFAULT_HWADDR, "dmx-node"),
    };
    let config = Arc::new(ArcSwap::from_pointee(node_config));

    #[cfg(unix)]
    if let Some(path) = &args.config {
        if let Err(e) = nodeaddr::signal::spawn_sighup_handler(config.clone(), path.clone()) {
            warn!(%e, "SIGHUP reload unavailable");
        }
    }

    let journal = match open_journal(args.events.as_deref()) {
        Ok(writer) => JournalSink::new(writer),
        Err(e) => {
            error!(%e, "failed to open event journal");
            return ExitCode::FAILURE;
        }
    };

    let mut network = if args.no_server {
        SimNetwork::new()
    } else {
        SimNetwork::with_server(SimDhcpServer::lab())
    };
    for (i, ip) in args.conflicts.iter().enumerate() {
        let Some(mac) = conflict_host_mac(i) else {
            error!(count = args.conflicts.len(), "at most 255 --conflict hosts are supported");
            return ExitCode::FAILURE;
        };
        network.add_host(mac, *ip, true);
    }

    let mut node = match args.seed {
        Some(seed) => AddressCoordinator::with_seed(config, network, journal, seed),
        None => AddressCoordinator::new(config, network, journal),
    };

    let mut clock: Box<dyn Clock> = if args.realtime {
        Box::new(SystemClock::new())
    } else {
        Box::new(ManualClock::default())
    };

    let end = Instant::from_secs(args.seconds);
    let flap_at = args.flap_at.map(Instant::from_secs);
    let mut relink_at: Option<Instant> = None;
    info!(seconds = args.seconds, realtime = args.realtime, server = !args.no_server, "starting simulation");

    let now = clock.now();
    node.sink_mut().set_time(now);
    node.on_link_up(now);

    while clock.now() < end {
        clock.wait(STEP);
        let now = clock.now();
        node.sink_mut().set_time(now);

        if flap_at.is_some_and(|at| now >= at) && relink_at.is_none() && node.is_link_up() {
            node.on_link_down();
            relink_at = Some(now + FLAP_DOWNTIME);
        }
        if relink_at.is_some_and(|at| now >= at) && !node.is_link_up() {
            node.on_link_up(now);
        }

        sim::step(&mut node, now);
    }

    let network = node.transport();
    info!(
        address = ?node.current_address().map(|a| a.network),
        origin = ?node.current_address().map(|a| a.origin),
        dhcp = ?node.dhcp_status(),
        acd = ?node.acd_state(),
        arp_sent = network.arp_sent().count(),
        dhcp_sent = network.dhcp_sent().count(),
        journal_dropped = node.sink().dropped(),
        "simulation finished"
    );

    if let Err(e) = node.sink_mut().flush() {
        error!(%e, "failed to flush event journal");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_hosts_get_distinct_macs() {
        assert_eq!(
            conflict_host_mac(0),
            Some(MacAddr6::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]))
        );
        assert_eq!(
            conflict_host_mac(254),
            Some(MacAddr6::new([0x02, 0x00, 0x00, 0x00, 0x00, 0xff]))
        );
        assert_eq!(conflict_host_mac(255), None);
        assert_eq!(conflict_host_mac(usize::MAX), None);
    }
}
