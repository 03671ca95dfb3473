//! Transactions: staged edits committed as few writes as possible
//!
//! Edits are staged per `(parameter, meta)` and checked as a whole before
//! anything is sent. Commit then issues one `write_multiple` per meta in
//! [`MetaEnum::WRITE_ORDER`], so limits move before the values they bound.
//! Writes already sent are never rolled back; after a failure the remaining
//! meta groups are reported as aborted.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{NvError, NvResult};
use crate::meta::MetaEnum;
use crate::protocol::{NvProtocol, RequestContext};
use crate::registry::{ParamId, Registry};

/// Key of a staged edit
pub type StagedKey = (ParamId, MetaEnum);

/// Result of one staged edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// The device accepted the write and echoed this raw value
    Written(i64),
    Failed(String),
    /// Not sent because an earlier group failed
    Aborted,
}

/// Per-edit outcomes of a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub outcomes: BTreeMap<StagedKey, Outcome>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|o| matches!(o, Outcome::Written(_)))
    }

    pub fn get(&self, id: ParamId, meta: MetaEnum) -> Option<&Outcome> {
        self.outcomes.get(&(id, meta))
    }

    /// Edits that did not reach the device
    pub fn failed(&self) -> Vec<StagedKey> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, Outcome::Written(_)))
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Host-side accumulator of edits
pub struct TransactionManager {
    protocol: NvProtocol,
    staged: Mutex<Option<BTreeMap<StagedKey, i64>>>,
    enforce_range: bool,
}

impl TransactionManager {
    pub fn new(protocol: NvProtocol, enforce_range: bool) -> Self {
        Self {
            protocol,
            staged: Mutex::new(None),
            enforce_range,
        }
    }

    /// Open a transaction; nesting is an error
    pub fn begin(&self) -> NvResult<()> {
        let mut staged = self.staged.lock();
        if staged.is_some() {
            return Err(NvError::TransactionOpen);
        }
        *staged = Some(BTreeMap::new());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.staged.lock().is_some()
    }

    /// Record an edit; staging the same slot again replaces the value
    pub fn stage(&self, id: ParamId, meta: MetaEnum, raw: i64) -> NvResult<()> {
        self.protocol.registry().read().param(id)?;
        let mut staged = self.staged.lock();
        let edits = staged.as_mut().ok_or(NvError::NoTransaction)?;
        edits.insert((id, meta), raw);
        Ok(())
    }

    /// Staged edits so far
    pub fn staged(&self) -> Vec<(StagedKey, i64)> {
        self.staged
            .lock()
            .as_ref()
            .map(|edits| edits.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    /// Discard the open transaction
    pub fn abort(&self) {
        if self.staged.lock().take().is_some() {
            info!("Transaction aborted");
        }
    }

    /// Check and send every staged edit
    ///
    /// A failed check returns the error before any frame is sent. Transport
    /// failures are reported per edit in the returned map. The transaction
    /// is closed either way.
    pub async fn commit(&self, ctx: &RequestContext) -> NvResult<CommitReport> {
        let edits = self.staged.lock().take().ok_or(NvError::NoTransaction)?;
        if edits.is_empty() {
            return Ok(CommitReport::default());
        }

        let password = {
            let registry = self.protocol.registry().read();
            self.check(&registry, &edits)?;
            registry.access_password_param()
        };

        let mut groups: Vec<BTreeMap<ParamId, i64>> = Vec::new();
        let mut group_metas = Vec::new();
        for meta in MetaEnum::WRITE_ORDER {
            let group: BTreeMap<ParamId, i64> = edits
                .iter()
                .filter(|((_, m), _)| *m == meta)
                .map(|((id, _), raw)| (*id, *raw))
                .collect();
            if group.is_empty() {
                continue;
            }
            // The password unlocks the device before anything else is written
            let (first, rest): (BTreeMap<_, _>, BTreeMap<_, _>) =
                group.into_iter().partition(|(id, _)| Some(*id) == password);
            for part in [first, rest] {
                if !part.is_empty() {
                    groups.push(part);
                    group_metas.push(meta);
                }
            }
        }

        // One request per multiplex id, so a failure only marks its own frame
        let mut batches = Vec::new();
        {
            let registry = self.protocol.registry().read();
            for (group, meta) in groups.iter().zip(group_metas) {
                let ids: Vec<ParamId> = group.keys().copied().collect();
                for members in registry.group_by_mux(&ids)?.into_values() {
                    let batch: BTreeMap<ParamId, i64> =
                        members.iter().map(|id| (*id, group[id])).collect();
                    batches.push((batch, meta));
                }
            }
        }

        info!(edits = edits.len(), requests = batches.len(), "Committing transaction");
        let mut report = CommitReport::default();
        let mut failed = false;
        // Values already accepted, sent again as siblings (secrets are not cached)
        let mut written: BTreeMap<MetaEnum, BTreeMap<ParamId, i64>> = BTreeMap::new();
        for (group, meta) in &batches {
            let meta = *meta;
            if failed {
                for id in group.keys() {
                    report.outcomes.insert((*id, meta), Outcome::Aborted);
                }
                continue;
            }
            let carry = written.get(&meta).cloned().unwrap_or_default();
            match self.protocol.write_multiple_with(ctx, group, meta, &carry).await {
                Ok(echo) => {
                    written
                        .entry(meta)
                        .or_default()
                        .extend(echo.iter().map(|(id, raw)| (*id, *raw)));
                    for id in group.keys() {
                        let outcome = match echo.get(id) {
                            Some(raw) => Outcome::Written(*raw),
                            None => Outcome::Failed("no echo".to_string()),
                        };
                        report.outcomes.insert((*id, meta), outcome);
                    }
                }
                Err(e) => {
                    warn!(%meta, error = %e, "Transaction write failed, aborting the rest");
                    for id in group.keys() {
                        report.outcomes.insert((*id, meta), Outcome::Failed(e.to_string()));
                    }
                    failed = true;
                }
            }
        }
        Ok(report)
    }

    fn check(&self, registry: &Registry, edits: &BTreeMap<StagedKey, i64>) -> NvResult<()> {
        let staged = |id: ParamId, meta: MetaEnum| edits.get(&(id, meta)).copied();

        if let Some(level) = registry.access_level_param() {
            let level_staged = edits.keys().any(|(id, _)| *id == level);
            let password_staged = registry
                .access_password_param()
                .is_some_and(|pw| edits.keys().any(|(id, _)| *id == pw));
            if level_staged && !password_staged {
                return Err(NvError::AccessPasswordRequired);
            }
        }

        for (&(id, meta), &raw) in edits {
            let param = registry.param(id)?;
            if param.flags().read_only {
                return Err(NvError::ReadOnly(param.name().to_string()));
            }
            if !self.protocol.metas().contains(&meta) {
                return Err(NvError::UnsupportedMeta(meta));
            }
            param.signal().check_width(raw)?;

            // Limits staged in the same transaction take precedence
            let (cached_min, cached_max) = param.limits();
            let min = staged(id, MetaEnum::Minimum).or(cached_min);
            let max = staged(id, MetaEnum::Maximum).or(cached_max);
            match meta {
                MetaEnum::Minimum | MetaEnum::Maximum => {
                    if let (Some(min), Some(max)) = (min, max) {
                        if min > max {
                            return Err(NvError::OutOfRange {
                                name: param.name().to_string(),
                                value: raw,
                                min: Some(min),
                                max: Some(max),
                            });
                        }
                    }
                }
                _ => registry.validate_with_limits(id, meta, raw, self.enforce_range, min, max)?,
            }
        }
        Ok(())
    }
}
