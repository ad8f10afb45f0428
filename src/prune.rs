//! Backup retention
//!
//! A [`PrunePolicy`] is a set of `keep-*` buckets. [`prune_mark`] decides
//! for every backup of a guest whether it is kept, removed or protected.
//! Calendar buckets use the timestamp embedded in the archive name as is,
//! which is the local time of the host that created the backup.

use crate::error::{Error, Result};
use crate::types::GuestType;
use crate::volname::BackupName;
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Retention policy, the value of the `prune-backups` storage property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrunePolicy {
    pub keep_all: bool,
    pub keep_last: u32,
    pub keep_hourly: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl PrunePolicy {
    /// Policy equivalent to the legacy `maxfiles` property
    pub fn from_maxfiles(maxfiles: u32) -> Self {
        if maxfiles == 0 {
            PrunePolicy {
                keep_all: true,
                ..Default::default()
            }
        } else {
            PrunePolicy {
                keep_last: maxfiles,
                ..Default::default()
            }
        }
    }

    /// A policy without any positive bucket keeps everything
    pub fn keeps_all(&self) -> bool {
        self.keep_all || self.counts().iter().all(|(_, n)| *n == 0)
    }

    fn counts(&self) -> [(&'static str, u32); 6] {
        [
            ("keep-last", self.keep_last),
            ("keep-hourly", self.keep_hourly),
            ("keep-daily", self.keep_daily),
            ("keep-weekly", self.keep_weekly),
            ("keep-monthly", self.keep_monthly),
            ("keep-yearly", self.keep_yearly),
        ]
    }
}

impl FromStr for PrunePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut policy = PrunePolicy::default();

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::parse("prune option", part, "expected 'key=value'"))?;
            let value: u32 = value
                .trim()
                .parse()
                .map_err(|_| Error::parse("prune option", part, "expected an integer"))?;

            match key.trim() {
                "keep-all" => policy.keep_all = value != 0,
                "keep-last" => policy.keep_last = value,
                "keep-hourly" => policy.keep_hourly = value,
                "keep-daily" => policy.keep_daily = value,
                "keep-weekly" => policy.keep_weekly = value,
                "keep-monthly" => policy.keep_monthly = value,
                "keep-yearly" => policy.keep_yearly = value,
                other => return Err(Error::parse("prune option", other, "unknown option")),
            }
        }

        if policy.keep_all && policy.counts().iter().any(|(_, n)| *n > 0) {
            return Err(Error::parse(
                "prune options",
                s,
                "keep-all cannot be set together with other options",
            ));
        }

        Ok(policy)
    }
}

impl fmt::Display for PrunePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keep_all {
            return write!(f, "keep-all=1");
        }
        let parts: Vec<String> = self
            .counts()
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| format!("{}={}", k, n))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Retention decision for a single backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneMark {
    Keep,
    Remove,
    Protected,
}

impl PruneMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            PruneMark::Keep => "keep",
            PruneMark::Remove => "remove",
            PruneMark::Protected => "protected",
        }
    }
}

impl fmt::Display for PruneMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backup considered for pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneItem {
    pub volid: String,
    pub guest_type: Option<GuestType>,
    pub owner: Option<u32>,
    pub ctime: Option<NaiveDateTime>,
    pub mark: PruneMark,
}

impl PruneItem {
    /// Build an item from a backup archive; `protected` marks archives
    /// carrying a protection marker
    pub fn new(volid: impl Into<String>, backup: &BackupName, protected: bool) -> Self {
        let mark = if protected || !backup.is_standard() {
            PruneMark::Protected
        } else {
            // placeholder until prune_mark runs
            PruneMark::Remove
        };
        PruneItem {
            volid: volid.into(),
            guest_type: backup.guest_type,
            owner: backup.owner,
            ctime: backup.ctime,
            mark,
        }
    }

    /// Identifier of the guest group, e.g. `qemu/100`
    pub fn backup_id(&self) -> String {
        match (self.guest_type, self.owner) {
            (Some(t), Some(id)) => format!("{}/{}", t, id),
            (None, Some(id)) => format!("unknown/{}", id),
            _ => "unknown".to_string(),
        }
    }
}

type BucketKey = fn(&NaiveDateTime) -> String;

fn hour_key(t: &NaiveDateTime) -> String {
    t.format("%Y/%m/%d/%H").to_string()
}

fn day_key(t: &NaiveDateTime) -> String {
    t.format("%Y/%m/%d").to_string()
}

fn week_key(t: &NaiveDateTime) -> String {
    let week = t.iso_week();
    format!("{}/{}", week.year(), week.week())
}

fn month_key(t: &NaiveDateTime) -> String {
    t.format("%Y/%m").to_string()
}

fn year_key(t: &NaiveDateTime) -> String {
    t.format("%Y").to_string()
}

/// Mark up to `count` buckets in one group
///
/// `order` holds the group's item indices, newest first. Buckets that
/// already contain a kept item are skipped. The first unmarked item of each
/// new bucket is kept; later items of a bucket kept here are removed.
fn mark_buckets(
    order: &[usize],
    marks: &mut [Option<PruneMark>],
    count: u32,
    key: impl Fn(usize) -> String,
) {
    if count == 0 {
        return;
    }

    let covered: HashSet<String> = order
        .iter()
        .filter(|&&i| marks[i] == Some(PruneMark::Keep))
        .map(|&i| key(i))
        .collect();
    let mut newly_kept: HashSet<String> = HashSet::new();

    for &i in order {
        if marks[i].is_some() {
            continue;
        }
        let bucket = key(i);
        if covered.contains(&bucket) {
            continue;
        }
        if newly_kept.contains(&bucket) {
            marks[i] = Some(PruneMark::Remove);
        } else {
            if newly_kept.len() >= count as usize {
                break;
            }
            newly_kept.insert(bucket);
            marks[i] = Some(PruneMark::Keep);
        }
    }
}

/// Compute retention marks for all items in place
///
/// Items are handled per guest group (guest type and id). Protected items
/// keep their mark and take no part in bucket accounting. The result
/// depends only on the item set, not on its order.
pub fn prune_mark(items: &mut [PruneItem], policy: &PrunePolicy) {
    let mut groups: BTreeMap<(Option<GuestType>, Option<u32>), Vec<usize>> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        if item.mark != PruneMark::Protected {
            groups.entry((item.guest_type, item.owner)).or_default().push(i);
        }
    }

    let mut marks: Vec<Option<PruneMark>> = vec![None; items.len()];

    for order in groups.values_mut() {
        order.sort_by(|&a, &b| {
            items[b]
                .ctime
                .cmp(&items[a].ctime)
                .then_with(|| items[a].volid.cmp(&items[b].volid))
        });

        if policy.keeps_all() {
            for &i in order.iter() {
                marks[i] = Some(PruneMark::Keep);
            }
            continue;
        }

        // keep-last treats every item as its own bucket
        mark_buckets(order, &mut marks, policy.keep_last, |i| i.to_string());

        let rules: [(u32, BucketKey); 5] = [
            (policy.keep_hourly, hour_key),
            (policy.keep_daily, day_key),
            (policy.keep_weekly, week_key),
            (policy.keep_monthly, month_key),
            (policy.keep_yearly, year_key),
        ];
        for (count, key) in rules {
            mark_buckets(order, &mut marks, count, |i| {
                items[i].ctime.as_ref().map(key).unwrap_or_default()
            });
        }
    }

    for (item, mark) in items.iter_mut().zip(marks) {
        if item.mark != PruneMark::Protected {
            item.mark = mark.unwrap_or(PruneMark::Remove);
        }
    }
}
