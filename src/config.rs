//! YAML configuration loading for policies, AQM parameters, and schedulers.
//!
//! This module only shapes YAML into the records the component constructors
//! consume ([`PolicySpec`], [`RedParams`], scheduler configs); all range and
//! consistency validation stays in those constructors so there is exactly
//! one checking path.
//!
//! # Example
//! ```yaml
//! policies:
//!   - id: 1
//!     name: gold
//!     cir_bps: 1000000
//!     pir_bps: 2000000
//!     cbs_bytes: 1500
//!     ebs_bytes: 3000
//!     algorithm: strict_priority
//!     drop_on_red: true
//!     green:  { priority: 7, queue: 10 }
//!     yellow: { priority: 4, queue: 11 }
//!     red:    { priority: 1, queue: 12 }
//! scheduler:
//!   kind: drr
//!   queues:
//!     - queue_id: 10
//!       quantum_bytes: 1500
//!       red: { min_bytes: 15000, max_bytes: 45000, max_probability: 0.1,
//!              ewma_weight: 0.002, capacity_bytes: 60000 }
//! ```

use crate::aqm::RedParams;
use crate::policy::{Algorithm, ColorTarget, PolicySpec, PolicyTree, NO_PARENT};
use crate::scheduler::{
    DeficitRoundRobin, DrrQueueConfig, Hfsc, HfscFlowConfig, SchedulerKind, ServiceCurve,
    StrictPriority, WeightedRoundRobin, WrrQueueConfig,
};
use color_eyre::eyre::{bail, ensure, eyre, Report, WrapErr};
use yaml_rust::{yaml::Hash, Yaml, YamlLoader};

fn take(node: &mut Hash, key: &str) -> Option<Yaml> {
    node.remove(&Yaml::String(key.to_owned()))
}

fn need(node: &mut Hash, key: &str) -> Result<Yaml, Report> {
    take(node, key).ok_or_else(|| eyre!("need `{}` key", key))
}

fn need_hash(y: Yaml, what: &str) -> Result<Hash, Report> {
    y.into_hash().ok_or_else(|| eyre!("`{}` must be a mapping", what))
}

fn to_u64(y: Yaml, key: &str) -> Result<u64, Report> {
    let v = y
        .into_i64()
        .ok_or_else(|| eyre!("`{}` must be an integer", key))?;
    ensure!(v >= 0, "`{}` must be non-negative", key);
    Ok(v as u64)
}

fn to_f64(y: Yaml, key: &str) -> Result<f64, Report> {
    match y {
        Yaml::Real(s) => s
            .parse()
            .map_err(|_| eyre!("`{}` is not a valid float", key)),
        Yaml::Integer(i) => Ok(i as f64),
        _ => bail!("`{}` must be a number", key),
    }
}

fn opt_u64(node: &mut Hash, key: &str, default: u64) -> Result<u64, Report> {
    match take(node, key) {
        Some(y) => to_u64(y, key),
        None => Ok(default),
    }
}

fn parse_algorithm(s: &str) -> Result<Algorithm, Report> {
    Ok(match s {
        "wfq" => Algorithm::Wfq,
        "wrr" => Algorithm::Wrr,
        "strict_priority" => Algorithm::StrictPriority,
        "drr" => Algorithm::Drr,
        "hfsc" => Algorithm::Hfsc,
        other => bail!("unknown scheduling algorithm `{}`", other),
    })
}

fn color_target_from_yaml(y: Yaml, color: &str) -> Result<ColorTarget, Report> {
    let mut node = need_hash(y, color)?;
    let priority = to_u64(need(&mut node, "priority")?, "priority")?;
    ensure!(priority <= u64::from(u8::MAX), "`priority` must fit in a byte");
    let queue_id = to_u64(need(&mut node, "queue")?, "queue")?;
    ensure!(queue_id <= u64::from(u32::MAX), "`queue` out of range");
    Ok(ColorTarget {
        priority: priority as u8,
        queue_id: queue_id as u32,
    })
}

fn policy_from_yaml(y: Yaml) -> Result<PolicySpec, Report> {
    let mut node = need_hash(y, "policy")?;
    let id = to_u64(need(&mut node, "id")?, "id")?;
    let parent_id = opt_u64(&mut node, "parent", NO_PARENT)?;
    let name = need(&mut node, "name")?
        .into_string()
        .ok_or_else(|| eyre!("`name` must be a string"))?;
    let cir_bps = to_u64(need(&mut node, "cir_bps")?, "cir_bps")?;
    let pir_bps = opt_u64(&mut node, "pir_bps", 0)?;
    let cbs_bytes = to_u64(need(&mut node, "cbs_bytes")?, "cbs_bytes")?;
    let ebs_bytes = opt_u64(&mut node, "ebs_bytes", 0)?;
    let algorithm = match take(&mut node, "algorithm") {
        Some(y) => parse_algorithm(
            &y.into_string()
                .ok_or_else(|| eyre!("`algorithm` must be a string"))?,
        )?,
        None => Algorithm::StrictPriority,
    };
    let weight = opt_u64(&mut node, "weight", 1)? as u32;
    let priority_level = opt_u64(&mut node, "priority_level", 0)? as u8;
    let drop_on_red = match take(&mut node, "drop_on_red") {
        Some(Yaml::Boolean(b)) => b,
        Some(_) => bail!("`drop_on_red` must be a boolean"),
        None => false,
    };
    let green = color_target_from_yaml(need(&mut node, "green")?, "green")?;
    let yellow = color_target_from_yaml(need(&mut node, "yellow")?, "yellow")?;
    let red = color_target_from_yaml(need(&mut node, "red")?, "red")?;

    Ok(PolicySpec {
        id,
        parent_id,
        name,
        cir_bps,
        pir_bps,
        cbs_bytes,
        ebs_bytes,
        algorithm,
        weight,
        priority_level,
        drop_on_red,
        targets: [green, yellow, red],
    })
}

fn red_from_yaml(y: Yaml) -> Result<RedParams, Report> {
    let mut node = need_hash(y, "red")?;
    RedParams::new(
        to_u64(need(&mut node, "min_bytes")?, "min_bytes")?,
        to_u64(need(&mut node, "max_bytes")?, "max_bytes")?,
        to_f64(need(&mut node, "max_probability")?, "max_probability")?,
        to_f64(need(&mut node, "ewma_weight")?, "ewma_weight")?,
        to_u64(need(&mut node, "capacity_bytes")?, "capacity_bytes")?,
    )
}

fn curve_from_yaml(node: &mut Hash, key: &str) -> Result<ServiceCurve, Report> {
    match take(node, key) {
        Some(y) => {
            let mut c = need_hash(y, key)?;
            Ok(ServiceCurve::new(
                opt_u64(&mut c, "rate_bps", 0)?,
                opt_u64(&mut c, "delay_us", 0)?,
            ))
        }
        None => Ok(ServiceCurve::none()),
    }
}

fn scheduler_from_yaml(y: Yaml) -> Result<SchedulerKind, Report> {
    let mut node = need_hash(y, "scheduler")?;
    let kind = need(&mut node, "kind")?
        .into_string()
        .ok_or_else(|| eyre!("`kind` must be a string"))?;
    match kind.as_str() {
        "strict_priority" => {
            let levels = need(&mut node, "levels")?
                .into_vec()
                .ok_or_else(|| eyre!("`levels` must be a list"))?
                .into_iter()
                .map(red_from_yaml)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StrictPriority::new(levels)?.into())
        }
        "wrr" => {
            let queues = need(&mut node, "queues")?
                .into_vec()
                .ok_or_else(|| eyre!("`queues` must be a list"))?
                .into_iter()
                .map(|q| {
                    let mut q = need_hash(q, "queue")?;
                    Ok::<_, Report>(WrrQueueConfig {
                        queue_id: to_u64(need(&mut q, "queue_id")?, "queue_id")? as u32,
                        weight: to_u64(need(&mut q, "weight")?, "weight")? as u32,
                        aqm: red_from_yaml(need(&mut q, "red")?)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(WeightedRoundRobin::new(queues)?.into())
        }
        "drr" => {
            let queues = need(&mut node, "queues")?
                .into_vec()
                .ok_or_else(|| eyre!("`queues` must be a list"))?
                .into_iter()
                .map(|q| {
                    let mut q = need_hash(q, "queue")?;
                    Ok::<_, Report>(DrrQueueConfig {
                        queue_id: to_u64(need(&mut q, "queue_id")?, "queue_id")? as u32,
                        quantum_bytes: to_u64(need(&mut q, "quantum_bytes")?, "quantum_bytes")?,
                        aqm: red_from_yaml(need(&mut q, "red")?)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DeficitRoundRobin::new(queues)?.into())
        }
        "hfsc" => {
            let classes = need(&mut node, "classes")?
                .into_vec()
                .ok_or_else(|| eyre!("`classes` must be a list"))?
                .into_iter()
                .map(|c| {
                    let mut c = need_hash(c, "class")?;
                    Ok::<_, Report>(HfscFlowConfig {
                        flow_id: to_u64(need(&mut c, "flow_id")?, "flow_id")?,
                        parent_id: opt_u64(&mut c, "parent", 0)?,
                        rt: curve_from_yaml(&mut c, "rt")?,
                        ls: curve_from_yaml(&mut c, "ls")?,
                        ul: curve_from_yaml(&mut c, "ul")?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Hfsc::new(classes)?.into())
        }
        other => bail!("unknown scheduler kind `{}`", other),
    }
}

fn load_root(cfg: &str) -> Result<Hash, Report> {
    let mut docs =
        YamlLoader::load_from_str(cfg).wrap_err_with(|| eyre!("error reading {:?}", cfg))?;
    ensure!(docs.len() == 1, "config needs exactly one YAML document");
    need_hash(docs.remove(0), "config")
}

/// Parse the `policies:` list of a config document.
pub fn policies_from_str(cfg: &str) -> Result<Vec<PolicySpec>, Report> {
    let mut root = load_root(cfg)?;
    need(&mut root, "policies")?
        .into_vec()
        .ok_or_else(|| eyre!("`policies` must be a list"))?
        .into_iter()
        .map(policy_from_yaml)
        .collect()
}

/// Parse `policies:` and build the tree. Parents must be listed before
/// their children.
pub fn policy_tree_from_str(cfg: &str) -> Result<PolicyTree, Report> {
    let mut tree = PolicyTree::new();
    for spec in policies_from_str(cfg)? {
        tree.insert(spec)?;
    }
    Ok(tree)
}

pub fn policy_tree_from_file(path: impl AsRef<std::path::Path>) -> Result<PolicyTree, Report> {
    let cfg = std::fs::read_to_string(path.as_ref())
        .wrap_err_with(|| eyre!("could not read {:?}", path.as_ref()))?;
    policy_tree_from_str(&cfg)
}

/// Parse the `scheduler:` section of a config document and construct the
/// scheduler it describes.
pub fn scheduler_from_str(cfg: &str) -> Result<SchedulerKind, Report> {
    let mut root = load_root(cfg)?;
    scheduler_from_yaml(need(&mut root, "scheduler")?)
}

pub fn scheduler_from_file(path: impl AsRef<std::path::Path>) -> Result<SchedulerKind, Report> {
    let cfg = std::fs::read_to_string(path.as_ref())
        .wrap_err_with(|| eyre!("could not read {:?}", path.as_ref()))?;
    scheduler_from_str(&cfg)
}

/// Quick scheduler construction from an argument string, for harnesses and
/// experiment drivers.
#[cfg(feature = "cfg-argparse")]
pub mod parse_args {
    use std::str::FromStr;

    use clap::Parser;
    use color_eyre::eyre::{bail, eyre, Report};

    use crate::aqm::RedParams;
    use crate::scheduler::{
        DeficitRoundRobin, DrrQueueConfig, SchedulerKind, StrictPriority, WeightedRoundRobin,
        WrrQueueConfig,
    };

    #[derive(Parser, Debug)]
    #[command(name = "qshape")]
    pub struct Opt {
        /// strict-priority, wrr, or drr (hfsc is yaml-only)
        #[arg(short, long)]
        pub kind: String,

        /// number of levels for strict-priority
        #[arg(long, default_value_t = 8)]
        pub levels: usize,

        /// id=weight (wrr) or id=quantum_bytes (drr)
        #[arg(long)]
        pub queue: Vec<QueueOpt>,

        /// min:max:max_p:ewma_w:capacity, shared by every queue
        #[arg(long)]
        pub red: RedOpt,
    }

    #[derive(Clone, Copy, Debug)]
    pub struct QueueOpt {
        id: u32,
        value: u64,
    }

    impl FromStr for QueueOpt {
        type Err = Report;
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let mut sp = s.split('=');
            let id = sp
                .next()
                .ok_or_else(|| eyre!("id=value format for queue"))?
                .parse()?;
            let value = sp
                .next()
                .ok_or_else(|| eyre!("id=value format for queue"))?
                .parse()?;
            Ok(QueueOpt { id, value })
        }
    }

    #[derive(Clone, Copy, Debug)]
    pub struct RedOpt {
        min: u64,
        max: u64,
        max_p: f64,
        ewma_w: f64,
        capacity: u64,
    }

    impl FromStr for RedOpt {
        type Err = Report;
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let parts: Vec<_> = s.split(':').collect();
            let &[min, max, max_p, ewma_w, capacity] = &parts[..] else {
                bail!("red format is min:max:max_p:ewma_w:capacity");
            };
            Ok(RedOpt {
                min: min.parse()?,
                max: max.parse()?,
                max_p: max_p.parse()?,
                ewma_w: ewma_w.parse()?,
                capacity: capacity.parse()?,
            })
        }
    }

    impl TryFrom<RedOpt> for RedParams {
        type Error = Report;
        fn try_from(r: RedOpt) -> Result<Self, Self::Error> {
            RedParams::new(r.min, r.max, r.max_p, r.ewma_w, r.capacity)
        }
    }

    impl TryFrom<Opt> for SchedulerKind {
        type Error = Report;
        fn try_from(o: Opt) -> Result<Self, Self::Error> {
            let red: RedParams = o.red.try_into()?;
            Ok(match o.kind.as_str() {
                "strict-priority" => StrictPriority::new(vec![red; o.levels])?.into(),
                "wrr" => WeightedRoundRobin::new(
                    o.queue
                        .iter()
                        .map(|q| WrrQueueConfig {
                            queue_id: q.id,
                            weight: q.value as u32,
                            aqm: red,
                        })
                        .collect(),
                )?
                .into(),
                "drr" => DeficitRoundRobin::new(
                    o.queue
                        .iter()
                        .map(|q| DrrQueueConfig {
                            queue_id: q.id,
                            quantum_bytes: q.value,
                            aqm: red,
                        })
                        .collect(),
                )?
                .into(),
                other => bail!("unknown scheduler kind `{}`", other),
            })
        }
    }

    impl FromStr for SchedulerKind {
        type Err = Report;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let sp = s.split_whitespace();
            let dummy = std::iter::once("tmp");
            let opt = Opt::try_parse_from(dummy.chain(sp))?;
            opt.try_into()
        }
    }

}
