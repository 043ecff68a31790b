//! Static catalog of tunable kernel and NIC parameters.
//!
//! Hardcoded for now; the long-term plan is auto-discovery (`sysctl -a`,
//! /sys scans, ethtool queries) exported to a data file this module loads.
//! Unknown parameters are therefore a warning in permissive validation mode
//! so new tunables can be exercised before they land here.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    Categorical,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Categorical => "categorical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Sysctl,
    Sysfs,
    Cpufreq,
    Ethtool,
}

impl Category {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sysctl" => Some(Self::Sysctl),
            "sysfs" => Some(Self::Sysfs),
            "cpufreq" => Some(Self::Cpufreq),
            "ethtool" => Some(Self::Ethtool),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sysctl => "sysctl",
            Self::Sysfs => "sysfs",
            Self::Cpufreq => "cpufreq",
            Self::Ethtool => "ethtool",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParameterMeta {
    pub name: &'static str,
    pub kind: ParamKind,
    pub category: Category,
    /// Changing the parameter can interrupt traffic or sessions.
    pub causes_downtime: bool,
    pub description: &'static str,
    pub typical_range: Option<(f64, f64)>,
    pub available_values: Option<&'static [&'static str]>,
    /// sysfs path template, where applicable.
    pub path: Option<&'static str>,
}

const fn int(name: &'static str, category: Category, description: &'static str) -> ParameterMeta {
    ParameterMeta {
        name,
        kind: ParamKind::Int,
        category,
        causes_downtime: false,
        description,
        typical_range: None,
        available_values: None,
        path: None,
    }
}

const fn int_ranged(
    name: &'static str,
    category: Category,
    description: &'static str,
    lower: f64,
    upper: f64,
) -> ParameterMeta {
    ParameterMeta {
        typical_range: Some((lower, upper)),
        ..int(name, category, description)
    }
}

const fn float_ranged(
    name: &'static str,
    category: Category,
    description: &'static str,
    lower: f64,
    upper: f64,
) -> ParameterMeta {
    ParameterMeta {
        kind: ParamKind::Float,
        typical_range: Some((lower, upper)),
        ..int(name, category, description)
    }
}

const fn categorical(
    name: &'static str,
    category: Category,
    description: &'static str,
    values: &'static [&'static str],
) -> ParameterMeta {
    ParameterMeta {
        kind: ParamKind::Categorical,
        available_values: Some(values),
        ..int(name, category, description)
    }
}

const TOGGLE: &[&str] = &["0", "1"];
const ON_OFF: &[&str] = &["on", "off"];

static PARAMETERS: &[ParameterMeta] = &[
    // TCP buffer management
    int("net.ipv4.tcp_rmem", Category::Sysctl, "TCP read buffer (min, default, max)"),
    int("net.ipv4.tcp_wmem", Category::Sysctl, "TCP write buffer (min, default, max)"),
    int("net.ipv4.tcp_mem", Category::Sysctl, "TCP memory pages (min, pressure, max)"),
    // TCP connection management
    int_ranged("net.ipv4.tcp_fin_timeout", Category::Sysctl, "TCP FIN timeout in seconds", 5.0, 120.0),
    categorical("net.ipv4.tcp_tw_reuse", Category::Sysctl, "Reuse TIME_WAIT sockets", TOGGLE),
    int_ranged("net.ipv4.tcp_max_tw_buckets", Category::Sysctl, "Max TIME_WAIT sockets", 8_000.0, 600_000.0),
    int_ranged("net.ipv4.tcp_max_syn_backlog", Category::Sysctl, "Max pending SYN connections", 128.0, 8192.0),
    int("net.ipv4.tcp_keepalive_time", Category::Sysctl, "Keepalive time in seconds"),
    int("net.ipv4.tcp_keepalive_intvl", Category::Sysctl, "Keepalive interval in seconds"),
    int("net.ipv4.tcp_keepalive_probes", Category::Sysctl, "Keepalive probes before dropping"),
    // TCP performance and features
    categorical("net.ipv4.tcp_window_scaling", Category::Sysctl, "TCP window scaling (RFC 7323)", TOGGLE),
    categorical("net.ipv4.tcp_sack", Category::Sysctl, "TCP selective acknowledgments", TOGGLE),
    categorical("net.ipv4.tcp_timestamps", Category::Sysctl, "TCP timestamps (PAWS)", TOGGLE),
    int_ranged("net.ipv4.tcp_fastopen", Category::Sysctl, "TCP Fast Open (TFO)", 0.0, 1024.0),
    int_ranged("net.ipv4.tcp_slow_start_after_idle", Category::Sysctl, "Seconds of idle before slow start", 0.0, 300.0),
    int_ranged("net.ipv4.tcp_mtu_probing", Category::Sysctl, "MTU probing", 0.0, 2.0),
    int_ranged("net.ipv4.tcp_frto", Category::Sysctl, "Forward RTO (F-RTO)", 0.0, 2.0),
    categorical(
        "net.ipv4.tcp_congestion_control",
        Category::Sysctl,
        "TCP congestion algorithm",
        &["reno", "cubic", "bbr", "bbr2", "htcp", "veno", "scalable"],
    ),
    // TCP retransmission and recovery
    int_ranged("net.ipv4.tcp_retries1", Category::Sysctl, "TCP retries before giving up", 3.0, 15.0),
    int_ranged("net.ipv4.tcp_retries2", Category::Sysctl, "TCP retries on timeout", 5.0, 15.0),
    int_ranged("net.ipv4.tcp_reordering", Category::Sysctl, "TCP packet reordering threshold", 0.0, 300.0),
    int_ranged("net.ipv4.tcp_syn_retries", Category::Sysctl, "SYN retries", 1.0, 10.0),
    int_ranged("net.ipv4.tcp_synack_retries", Category::Sysctl, "SYN-ACK retries", 1.0, 10.0),
    int_ranged("net.ipv4.tcp_limit_output_bytes", Category::Sysctl, "Per-socket TSQ byte limit", 65_536.0, 16_777_216.0),
    categorical("net.ipv4.tcp_thin_linear_timeouts", Category::Sysctl, "Linear timeouts for thin streams", TOGGLE),
    // Core networking
    int("net.core.rmem_default", Category::Sysctl, "Default socket receive buffer"),
    int("net.core.wmem_default", Category::Sysctl, "Default socket send buffer"),
    int("net.core.rmem_max", Category::Sysctl, "Max socket receive buffer"),
    int("net.core.wmem_max", Category::Sysctl, "Max socket send buffer"),
    int_ranged("net.core.netdev_budget", Category::Sysctl, "NAPI packets per poll cycle", 100.0, 2000.0),
    int_ranged("net.core.netdev_budget_usecs", Category::Sysctl, "NAPI poll cycle budget in usecs", 1000.0, 64_000.0),
    int_ranged("net.core.netdev_max_backlog", Category::Sysctl, "Max backlog queue length", 1000.0, 100_000.0),
    int_ranged("net.core.dev_weight", Category::Sysctl, "CPU weight for device processing", 16.0, 1024.0),
    int_ranged("net.core.somaxconn", Category::Sysctl, "Max listen() backlog", 128.0, 65_535.0),
    int("net.core.optmem_max", Category::Sysctl, "Max ancillary buffer per socket"),
    // IP
    categorical("net.ipv4.ip_nonlocal_bind", Category::Sysctl, "Bind to non-local addresses", TOGGLE),
    categorical("net.ipv4.ip_forward", Category::Sysctl, "IPv4 forwarding", TOGGLE),
    int_ranged("net.ipv4.icmp_ratelimit", Category::Sysctl, "ICMP rate limit in ms", 0.0, 10_000.0),
    // Virtual memory
    int_ranged("vm.swappiness", Category::Sysctl, "Swap aggressiveness", 0.0, 100.0),
    int_ranged("vm.vfs_cache_pressure", Category::Sysctl, "Dentry/inode cache reclaim pressure", 1.0, 500.0),
    int_ranged("vm.dirty_ratio", Category::Sysctl, "Dirty page writeback threshold (percent)", 1.0, 100.0),
    int_ranged("vm.dirty_background_ratio", Category::Sysctl, "Background writeback threshold (percent)", 1.0, 100.0),
    int_ranged("vm.dirty_expire_centisecs", Category::Sysctl, "Dirty page expiry in centisecs", 100.0, 30_000.0),
    int_ranged("vm.dirty_writeback_centisecs", Category::Sysctl, "Writeback wakeup interval in centisecs", 100.0, 30_000.0),
    categorical("vm.overcommit_memory", Category::Sysctl, "Memory overcommit policy", &["0", "1", "2"]),
    int("vm.min_free_kbytes", Category::Sysctl, "Reserved free memory"),
    int_ranged("vm.max_map_count", Category::Sysctl, "Max memory map areas per process", 65_530.0, 1_048_576.0),
    categorical("vm.zone_reclaim_mode", Category::Sysctl, "NUMA zone reclaim mode", &["0", "1", "2", "4"]),
    // Filesystem
    int("fs.file-max", Category::Sysctl, "System-wide open file limit"),
    int_ranged("fs.inotify.max_user_watches", Category::Sysctl, "Inotify watches per user", 8192.0, 1_048_576.0),
    int_ranged("fs.aio-max-nr", Category::Sysctl, "Max concurrent AIO requests", 65_536.0, 1_048_576.0),
    int_ranged("fs.pipe-max-size", Category::Sysctl, "Max pipe buffer size", 65_536.0, 16_777_216.0),
    // Kernel
    int_ranged("kernel.pid_max", Category::Sysctl, "Max PID value", 32_768.0, 4_194_304.0),
    int("kernel.threads-max", Category::Sysctl, "System-wide thread limit"),
    categorical("kernel.numa_balancing", Category::Sysctl, "Automatic NUMA balancing", TOGGLE),
    int("kernel.shmmax", Category::Sysctl, "Max shared memory segment size"),
    // sysfs
    ParameterMeta {
        path: Some("/sys/devices/system/cpu/cpu*/cpufreq/scaling_governor"),
        ..categorical(
            "cpu_governor",
            Category::Sysfs,
            "CPU frequency governor",
            &["performance", "powersave", "ondemand", "conservative", "schedutil", "userspace"],
        )
    },
    ParameterMeta {
        path: Some("/sys/kernel/mm/transparent_hugepage/enabled"),
        ..categorical(
            "transparent_hugepage",
            Category::Sysfs,
            "Transparent hugepages",
            &["always", "madvise", "never"],
        )
    },
    ParameterMeta {
        path: Some("/sys/kernel/mm/ksm/run"),
        ..int_ranged("ksm_run", Category::Sysfs, "Kernel samepage merging", 0.0, 1.0)
    },
    ParameterMeta {
        path: Some("/sys/kernel/mm/ksm/sleep_millisecs"),
        ..int_ranged("ksm_sleep_millisecs", Category::Sysfs, "KSM sleep interval", 0.0, 10_000.0)
    },
    ParameterMeta {
        path: Some("/sys/class/net/*/queue/disc"),
        ..ParameterMeta {
            causes_downtime: true,
            ..categorical(
                "qdisc",
                Category::Sysfs,
                "Queue discipline type",
                &["fq", "fq_codel", "codel", "pfifo_fast", "pfifo", "bfifo", "htb", "tbf", "sfq", "prio", "red", "choke", "noqueue"],
            )
        }
    },
    int_ranged("qdisc_fq_limit", Category::Sysfs, "FQ queue limit in packets", 100.0, 100_000.0),
    int_ranged("qdisc_fq_quantum", Category::Sysfs, "FQ quantum in bytes", 1514.0, 30_000.0),
    int_ranged("qdisc_fq_initial_quantum", Category::Sysfs, "FQ initial quantum in bytes", 1514.0, 100_000.0),
    categorical("qdisc_fq_pacing", Category::Sysfs, "FQ pacing", ON_OFF),
    int_ranged("qdisc_fq_codel_limit", Category::Sysfs, "FQ-CoDel queue limit in packets", 100.0, 100_000.0),
    int_ranged("qdisc_fq_codel_flows", Category::Sysfs, "FQ-CoDel flow count", 16.0, 65_536.0),
    int_ranged("qdisc_fq_codel_target", Category::Sysfs, "FQ-CoDel target delay in usecs", 500.0, 50_000.0),
    int_ranged("qdisc_fq_codel_interval", Category::Sysfs, "FQ-CoDel interval in usecs", 10_000.0, 1_000_000.0),
    categorical("qdisc_fq_codel_ecn", Category::Sysfs, "FQ-CoDel ECN marking", ON_OFF),
    int_ranged("qdisc_codel_limit", Category::Sysfs, "CoDel queue limit in packets", 100.0, 100_000.0),
    float_ranged("qdisc_red_probability", Category::Sysfs, "RED max marking probability", 0.0, 1.0),
    int_ranged("qdisc_sfq_perturb", Category::Sysfs, "SFQ hash perturbation seconds", 0.0, 600.0),
    // cpufreq
    categorical(
        "governor",
        Category::Cpufreq,
        "CPU frequency governor",
        &["performance", "powersave", "ondemand", "conservative", "schedutil", "userspace"],
    ),
    float_ranged("min_freq_ghz", Category::Cpufreq, "Minimum CPU frequency in GHz", 0.4, 5.0),
    float_ranged("max_freq_ghz", Category::Cpufreq, "Maximum CPU frequency in GHz", 0.4, 6.0),
    int("scaling_min_freq", Category::Cpufreq, "Minimum scaling frequency in kHz"),
    int("scaling_max_freq", Category::Cpufreq, "Maximum scaling frequency in kHz"),
    int_ranged("ondemand_up_threshold", Category::Cpufreq, "Ondemand governor up threshold", 1.0, 100.0),
    int_ranged("ondemand_powersave_bias", Category::Cpufreq, "Ondemand governor powersave bias", 0.0, 1000.0),
    int_ranged("conservative_up_threshold", Category::Cpufreq, "Conservative governor up threshold", 1.0, 100.0),
    int_ranged("conservative_down_threshold", Category::Cpufreq, "Conservative governor down threshold", 1.0, 100.0),
    int_ranged("schedutil_rate_limit_us", Category::Cpufreq, "Schedutil rate limit in usecs", 0.0, 10_000.0),
];

/// Ethtool options are keyed by option name and applied per interface, so
/// they live in their own table rather than under `PARAMETERS`.
static ETHTOOL_OPTIONS: &[ParameterMeta] = &[
    categorical("tso", Category::Ethtool, "TCP segmentation offload", ON_OFF),
    categorical("gso", Category::Ethtool, "Generic segmentation offload", ON_OFF),
    categorical("gro", Category::Ethtool, "Generic receive offload", ON_OFF),
    categorical("lro", Category::Ethtool, "Large receive offload", ON_OFF),
    categorical("rx_checksum", Category::Ethtool, "RX checksum offload", ON_OFF),
    categorical("tx_checksum", Category::Ethtool, "TX checksum offload", ON_OFF),
    int_ranged("rx_ring", Category::Ethtool, "RX ring buffer size", 64.0, 8192.0),
    int_ranged("tx_ring", Category::Ethtool, "TX ring buffer size", 64.0, 8192.0),
    int_ranged("rx_usecs", Category::Ethtool, "RX interrupt coalescing in usecs", 0.0, 1000.0),
    int_ranged("tx_usecs", Category::Ethtool, "TX interrupt coalescing in usecs", 0.0, 1000.0),
    categorical("adaptive_rx", Category::Ethtool, "Adaptive RX coalescing", ON_OFF),
    categorical("adaptive_tx", Category::Ethtool, "Adaptive TX coalescing", ON_OFF),
];

static PARAMETER_INDEX: Lazy<HashMap<&'static str, &'static ParameterMeta>> =
    Lazy::new(|| PARAMETERS.iter().map(|meta| (meta.name, meta)).collect());

static ETHTOOL_INDEX: Lazy<HashMap<&'static str, &'static ParameterMeta>> =
    Lazy::new(|| ETHTOOL_OPTIONS.iter().map(|meta| (meta.name, meta)).collect());

/// Look up a non-ethtool parameter by name.
pub fn lookup(name: &str) -> Option<&'static ParameterMeta> {
    PARAMETER_INDEX.get(name).copied()
}

/// Look up an ethtool option by name (interface-independent).
pub fn lookup_ethtool(option: &str) -> Option<&'static ParameterMeta> {
    ETHTOOL_INDEX.get(option).copied()
}

/// All registry entries for one category, in declaration order.
pub fn list_by_category(category: Category) -> Vec<&'static ParameterMeta> {
    let table: &[ParameterMeta] = if category == Category::Ethtool {
        ETHTOOL_OPTIONS
    } else {
        PARAMETERS
    };
    table.iter().filter(|meta| meta.category == category).collect()
}

/// Names of all supported entries in a category, for error messages.
pub fn supported_names(category: Category) -> Vec<&'static str> {
    list_by_category(category)
        .into_iter()
        .map(|meta| meta.name)
        .collect()
}
