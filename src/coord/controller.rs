//! Lifecycle controller
//!
//! Runs once per engine tick. Applies detected signals to the entity store
//! and dependency graph, merges and resumes unblockable parents, and drives
//! the scheduler. Sole writer of the store and graph.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collab::{CacheStore, Scheduler, SchedulerState, Tokenizer};
use crate::core::config::ControllerConfig;
use crate::core::errors::{Result, SeqHookError};
use crate::detect::{Event, ParseError, SignalDetector, SpawnRequest};
use crate::entity::{
    ChildState, FinishReason, ParentState, Sequence, SequenceId, SequenceStatus, DEFAULT_PRIORITY,
};
use crate::graph::{DependencyGraph, MergeRecord};
use crate::merge::{CombinerRegistry, MergeStrategy, ResultMerger};
use crate::resume::ResumePlanner;

use super::events::{next_sequence, now_ms, EventSink, LifecycleEnvelope, LifecycleEvent, EVENT_VERSION};
use super::snapshot::{ControllerState, Snapshot};
use super::stats::ControllerStats;
use super::types::{
    ChildDescriptor, EngineFinish, ResumeDirective, RootSpec, SequenceOutput, SpawnRejection, TickReport,
};

/// Per-tick orchestrator
pub struct LifecycleController {
    config: ControllerConfig,
    state: ControllerState,
    detector: SignalDetector,
    merger: ResultMerger,
    planner: ResumePlanner,
    scheduler: Box<dyn Scheduler>,
    tokenizer: Arc<dyn Tokenizer>,
    cache: Arc<dyn CacheStore>,
    sinks: Vec<Arc<dyn EventSink>>,
    stats: ControllerStats,
    tick: u64,
}

impl LifecycleController {
    pub fn new(
        config: ControllerConfig,
        scheduler: Box<dyn Scheduler>,
        tokenizer: Arc<dyn Tokenizer>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        config.validate()?;
        let detector = SignalDetector::new(config.grammar.clone(), config.payload_format, config.max_lookahead)?;
        info!(
            max_spawn_depth = config.limits.max_spawn_depth,
            textual = config.grammar.is_textual(),
            "Lifecycle controller initialized"
        );
        Ok(Self {
            config,
            state: ControllerState::new(),
            detector,
            merger: ResultMerger::default(),
            planner: ResumePlanner::new(),
            scheduler,
            tokenizer,
            cache,
            sinks: Vec::new(),
            stats: ControllerStats::default(),
            tick: 0,
        })
    }

    /// Use `registry` to resolve custom merge strategies
    pub fn with_combiners(mut self, registry: CombinerRegistry) -> Self {
        self.merger = ResultMerger::new(registry);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn combiners(&self) -> &CombinerRegistry {
        self.merger.registry()
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.state.store.get(id)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.state.graph
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    pub fn last_merge(&self, parent: SequenceId) -> Option<&MergeRecord> {
        self.state.graph.last_merge(parent)
    }

    pub fn stats(&self) -> ControllerStats {
        let mut stats = self.stats.clone();
        stats.live_sequences = self.state.store.len();
        stats.blocked_sequences = self.state.store.ids_with_status(SequenceStatus::BlockedSync).len();
        stats
    }

    /// Replace the controller state with a checkpoint. Buffered partial
    /// signals are dropped.
    pub fn restore(&mut self, state: ControllerState) {
        for seq in self.state.store.iter() {
            self.detector.clear(seq.id);
        }
        info!(sequences = state.store.len(), "Restoring controller state");
        self.state = state;
    }

    /// Register a root sequence admitted by the engine.
    pub fn register_root(&mut self, spec: RootSpec) -> Result<SequenceId> {
        let id = match spec.id {
            Some(id) => id,
            None => self.state.store.allocate_id(),
        };
        let seq = Sequence::new_root(
            id,
            spec.prompt_token_ids,
            spec.sampling,
            spec.merge_strategy
                .unwrap_or_else(|| self.config.default_merge_strategy.clone()),
            spec.priority.unwrap_or(DEFAULT_PRIORITY),
            Utc::now(),
        );
        self.state.store.insert(seq)?;
        self.stats.roots_registered += 1;
        info!(seq_id = id, "Root sequence registered");
        self.emit(LifecycleEvent::RootRegistered { seq_id: id });
        Ok(id)
    }

    pub fn tick(&mut self, outputs: &[SequenceOutput]) -> TickReport {
        self.tick_at(outputs, Utc::now())
    }

    /// Process one tick's outputs, in order, with an explicit clock.
    pub fn tick_at(&mut self, outputs: &[SequenceOutput], now: DateTime<Utc>) -> TickReport {
        self.tick += 1;
        self.stats.ticks += 1;
        let mut report = TickReport::default();

        for output in outputs {
            self.apply_output(output, now, &mut report);
        }
        self.enforce_block_timeout(now, &mut report);

        debug!(
            tick = self.tick,
            spawned = report.spawned.len(),
            blocked = report.blocked.len(),
            resumed = report.resumed.len(),
            released = report.released.len(),
            "Tick processed"
        );
        report
    }

    /// Cancel `id` and every descendant that has not finished.
    pub fn cancel(&mut self, id: SequenceId) -> Result<TickReport> {
        self.state.store.require(id)?;
        let mut report = TickReport::default();
        self.cancel_tree(id, FinishReason::Cancelled, Utc::now(), &mut report);
        Ok(report)
    }

    /// Merge `parent`'s completed sync target and resume it.
    ///
    /// When no sync is pending, returns the merge already applied without
    /// appending anything again.
    pub fn merge_and_resume(&mut self, parent: SequenceId) -> Result<MergeRecord> {
        if self.state.graph.has_pending_sync(parent) && !self.state.graph.all_targets_done(parent) {
            return Err(SeqHookError::internal(format!(
                "sync target of {} is still pending: {:?}",
                parent,
                self.state.graph.pending_targets(parent)
            )));
        }
        let mut report = TickReport::default();
        self.merge_into(parent, false, Utc::now(), &mut report)
    }

    fn apply_output(&mut self, output: &SequenceOutput, now: DateTime<Utc>, report: &mut TickReport) {
        let id = output.seq_id;
        let Some(status) = self.state.store.status(id) else {
            debug!(seq_id = id, "Ignoring output for unknown sequence");
            self.stats.ignored_outputs += 1;
            return;
        };
        if status.is_terminal() {
            debug!(seq_id = id, status = status.as_str(), "Ignoring output for finished sequence");
            self.stats.ignored_outputs += 1;
            return;
        }

        if status == SequenceStatus::BlockedSync {
            if !output.new_token_ids.is_empty() {
                warn!(seq_id = id, tokens = output.new_token_ids.len(), "Dropping output of a blocked sequence");
                self.stats.ignored_outputs += 1;
            }
            if let Some(EngineFinish::Failed(message)) = &output.finished {
                self.fail_sequence(id, message.clone(), now, report);
            }
            return;
        }

        let text = match &output.text {
            Some(text) => text.clone(),
            None => match self.tokenizer.decode(&output.new_token_ids) {
                Ok(text) => text,
                Err(e) => {
                    let err = SeqHookError::collaborator("tokenizer", "decode", &e);
                    error!(seq_id = id, error = %err, "Failed to decode generated tokens");
                    self.fail_sequence(id, err.to_string(), now, report);
                    return;
                }
            },
        };

        let base_offset = match self.state.store.get_mut(id) {
            Some(seq) => {
                if matches!(seq.status(), SequenceStatus::Pending | SequenceStatus::Resuming) {
                    if let Err(e) = seq.transition(SequenceStatus::Running) {
                        warn!(seq_id = id, error = %e, "Unexpected status on output");
                    }
                }
                let base = seq.len();
                seq.append_generated(&output.new_token_ids, &text);
                base
            }
            None => return,
        };

        let detection = self
            .detector
            .scan(id, base_offset, &output.new_token_ids, &text, self.tokenizer.as_ref());
        for parse_error in detection.errors {
            self.record_parse_error(parse_error, report);
        }
        for event in detection.events {
            self.apply_event(event, now, report);
        }

        match &output.finished {
            None => {}
            Some(finish) => {
                let Some(status) = self.state.store.status(id) else {
                    return;
                };
                if status.is_terminal() {
                    return;
                }
                match finish {
                    EngineFinish::Failed(message) => self.fail_sequence(id, message.clone(), now, report),
                    EngineFinish::Stop if status == SequenceStatus::BlockedSync => {
                        warn!(seq_id = id, "Engine stopped a blocked sequence; it resumes after the merge");
                    }
                    EngineFinish::Stop => {
                        self.complete_sequence(id, SequenceStatus::Finished, FinishReason::Stop, now, report)
                    }
                }
            }
        }
    }

    fn record_parse_error(&mut self, parse_error: ParseError, report: &mut TickReport) {
        self.stats.parse_errors += 1;
        let signal = parse_error.signal.map(|s| s.as_str()).unwrap_or("unknown");
        let err = SeqHookError::malformed(parse_error.seq_id, signal, parse_error.message.as_str());
        self.emit(LifecycleEvent::MalformedSignal {
            seq_id: parse_error.seq_id,
            signal: parse_error.signal.map(|s| s.as_str().to_string()),
            message: err.to_string(),
        });
        report.parse_errors.push(parse_error);
    }

    fn apply_event(&mut self, event: Event, now: DateTime<Utc>, report: &mut TickReport) {
        // Earlier events of the same tick may have ended the sequence
        if !self.state.store.is_live(event.origin()) {
            debug!(seq_id = event.origin(), kind = event.kind().as_str(), "Dropping signal of an ended sequence");
            return;
        }
        match event {
            Event::Spawn {
                parent_id,
                request,
                token_offset,
            } => self.apply_spawn(parent_id, request, token_offset, now, report),
            Event::Sync {
                parent_id, targets, ..
            } => self.apply_sync(parent_id, targets, now, report),
            Event::Return { child_id, text, .. } => self.apply_return(child_id, text, now, report),
        }
    }

    fn apply_spawn(
        &mut self,
        parent_id: SequenceId,
        request: SpawnRequest,
        token_offset: usize,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let requested_child = request.child_id;
        match self.try_spawn(parent_id, request, now) {
            Ok(descriptor) => {
                self.stats.children_spawned += 1;
                info!(
                    parent_id,
                    child_id = descriptor.id,
                    spawn_depth = descriptor.spawn_depth,
                    "Child spawned"
                );
                self.emit(LifecycleEvent::ChildSpawned {
                    parent_id,
                    child_id: descriptor.id,
                    spawn_depth: descriptor.spawn_depth,
                });
                report.spawned.push(descriptor);
            }
            Err(reason) => {
                self.stats.spawns_rejected += 1;
                warn!(parent_id, error = %reason, category = reason.category(), "Spawn rejected");
                self.emit(LifecycleEvent::SpawnRejected {
                    parent_id,
                    category: reason.category().to_string(),
                    reason: reason.to_string(),
                });
                report.rejected.push(SpawnRejection {
                    parent_id,
                    requested_child,
                    token_offset,
                    reason,
                });
            }
        }
    }

    /// All checks run before anything is mutated.
    fn try_spawn(&mut self, parent_id: SequenceId, request: SpawnRequest, now: DateTime<Utc>) -> Result<ChildDescriptor> {
        let store = &self.state.store;
        let parent = store.require(parent_id)?;

        if let Some(child_id) = request.child_id {
            let ancestors = store.ancestors(parent_id);
            if self.state.graph.would_create_cycle(parent_id, child_id, &ancestors) {
                return Err(SeqHookError::CycleDetected {
                    parent: parent_id,
                    child: child_id,
                });
            }
        }
        self.config
            .limits
            .check_spawn(
                parent_id,
                parent.spawn_depth,
                self.state.graph.unmerged_count(parent_id),
                store.len(),
            )?;
        if let Some(child_id) = request.child_id {
            if store.contains(child_id) {
                return Err(SeqHookError::DuplicateSequence { seq_id: child_id });
            }
        }

        let prompt_token_ids = self
            .tokenizer
            .encode(&request.prompt)
            .map_err(|e| SeqHookError::collaborator("tokenizer", "encode", &e))?;

        let child_id = match request.child_id {
            Some(id) => id,
            None => self.state.store.allocate_id(),
        };
        let parent = self.state.store.require(parent_id)?;
        let child = Sequence::new_child(
            child_id,
            parent,
            prompt_token_ids,
            &request.sampling,
            request.merge_strategy,
            request.priority,
            now,
        );
        let descriptor = ChildDescriptor {
            id: child_id,
            parent_id,
            prompt: request.prompt,
            prompt_token_ids: child.token_ids().to_vec(),
            sampling: child.sampling.clone(),
            priority: child.priority,
            spawn_depth: child.spawn_depth,
        };

        let admitted = self
            .scheduler
            .admit(&descriptor)
            .map_err(|e| SeqHookError::collaborator("scheduler", "admit", &e))?;
        if admitted != child_id {
            if let Err(e) = self.scheduler.free(admitted) {
                warn!(seq_id = admitted, error = %e, "Failed to free mis-admitted sequence");
            }
            return Err(SeqHookError::Collaborator {
                collaborator: "scheduler".to_string(),
                operation: "admit".to_string(),
                message: format!("admitted {} as {}", child_id, admitted),
            });
        }

        self.state.store.insert(child)?;
        self.state.graph.register_child(parent_id, child_id)?;
        let parent = self.state.store.require_mut(parent_id)?;
        parent.add_child(child_id);
        if parent.parent_state() == ParentState::Independent {
            parent.set_parent_state(ParentState::ParentActive);
        }
        Ok(descriptor)
    }

    fn apply_sync(
        &mut self,
        parent_id: SequenceId,
        targets: Option<Vec<SequenceId>>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        if self.state.store.status(parent_id) == Some(SequenceStatus::BlockedSync) {
            debug!(parent_id, "Parent already blocked on a sync, ignoring repeated sync");
            return;
        }
        let target = self
            .state
            .graph
            .record_sync_request(parent_id, targets.as_deref(), now);
        debug!(parent_id, target = ?target.children, explicit = target.explicit, "Sync requested");

        if self.state.graph.all_targets_done(parent_id) {
            if let Err(e) = self.merge_into(parent_id, false, now, report) {
                warn!(parent_id, error = %e, "Immediate merge failed");
                self.state.graph.take_sync_target(parent_id);
            }
            return;
        }

        let blocked = self
            .state
            .store
            .require_mut(parent_id)
            .and_then(|parent| parent.transition(SequenceStatus::BlockedSync));
        if let Err(e) = blocked {
            warn!(parent_id, error = %e, "Cannot block sequence, dropping its sync");
            self.state.graph.take_sync_target(parent_id);
            return;
        }
        let Some(parent) = self.state.store.get_mut(parent_id) else {
            return;
        };
        parent.set_parent_state(ParentState::ParentBlocked);
        self.state.graph.mark_blocked(parent_id, now);

        if let Err(e) = self.scheduler.mark_blocked(parent_id) {
            let err = SeqHookError::collaborator("scheduler", "mark_blocked", &e);
            error!(parent_id, error = %err, "Scheduler failed to block sequence");
            self.state.graph.take_sync_target(parent_id);
            self.fail_sequence(parent_id, err.to_string(), now, report);
            return;
        }

        let awaiting = self.state.graph.pending_targets(parent_id);
        self.stats.syncs_blocked += 1;
        info!(parent_id, awaiting = ?awaiting, "Parent blocked on sync");
        self.emit(LifecycleEvent::ParentBlocked { parent_id, awaiting });
        report.blocked.push(parent_id);
    }

    fn apply_return(&mut self, child_id: SequenceId, text: String, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(seq) = self.state.store.get_mut(child_id) else {
            return;
        };
        seq.set_result(text);
        match seq.status() {
            SequenceStatus::Running | SequenceStatus::Pending => {
                self.complete_sequence(child_id, SequenceStatus::Finished, FinishReason::Return, now, report);
                report.finished.push(child_id);
            }
            status => {
                debug!(
                    seq_id = child_id,
                    status = status.as_str(),
                    "Return recorded; completion follows the engine's finish"
                );
            }
        }
    }

    /// Move a sequence to a terminal status and propagate the completion.
    fn complete_sequence(
        &mut self,
        id: SequenceId,
        status: SequenceStatus,
        reason: FinishReason,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(seq) = self.state.store.get_mut(id) else {
            return;
        };
        if let Err(e) = seq.terminate(status, reason) {
            warn!(seq_id = id, error = %e, "Cannot complete sequence");
            return;
        }
        seq.set_child_state(ChildState::ChildFinished);
        let failed = status != SequenceStatus::Finished;
        let text = if failed {
            String::new()
        } else {
            seq.completion_text().to_string()
        };
        let parent_id = seq.parent_id;
        debug!(seq_id = id, status = status.as_str(), "Sequence completed");

        self.orphan_descendants(id, now, report);
        self.emit(LifecycleEvent::ChildCompleted {
            child_id: id,
            parent_id,
            failed,
        });
        self.propagate_completion(id, &text, failed, now, report);
        self.release_subtree(id, report);
    }

    fn fail_sequence(&mut self, id: SequenceId, message: String, now: DateTime<Utc>, report: &mut TickReport) {
        if !self.state.store.is_live(id) {
            return;
        }
        self.stats.failures += 1;
        report.failed.push(id);
        self.complete_sequence(id, SequenceStatus::Failed, FinishReason::Error(message), now, report);
    }

    /// Record `child`'s result with its parent and resume the parent if this
    /// was the last awaited completion.
    fn propagate_completion(
        &mut self,
        child: SequenceId,
        text: &str,
        failed: bool,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(parent) = self.state.graph.record_child_result(child, text, failed) else {
            return;
        };
        if self.state.store.status(parent) == Some(SequenceStatus::BlockedSync) {
            if let Err(e) = self.merge_into(parent, false, now, report) {
                warn!(parent_id = parent, error = %e, "Merge after child completion failed");
            }
        }
    }

    /// Merge the parent's sync target, append it, and hand the parent back
    /// to the scheduler.
    fn merge_into(
        &mut self,
        parent_id: SequenceId,
        forced: bool,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<MergeRecord> {
        if !self.state.graph.has_pending_sync(parent_id) {
            return self
                .state
                .graph
                .last_merge(parent_id)
                .cloned()
                .ok_or_else(|| SeqHookError::internal(format!("no merge recorded for {}", parent_id)));
        }

        let strategy = {
            let parent = self.state.store.require_mut(parent_id)?;
            parent.transition(SequenceStatus::Resuming)?;
            parent.set_parent_state(ParentState::ParentResuming);
            parent.merge_strategy.clone()
        };
        let target = self
            .state
            .graph
            .take_sync_target(parent_id)
            .ok_or_else(|| SeqHookError::internal(format!("sync target of {} vanished", parent_id)))?;
        let results = self.state.graph.ordered_results(parent_id, &target.children);

        let merged_text = match self.merger.merge(&results, &strategy) {
            Ok(text) => text,
            Err(e) => {
                warn!(parent_id, error = %e, "Merge strategy unavailable, using concatenate");
                self.merger.merge(&results, &MergeStrategy::default())?
            }
        };

        let tokens = match self.tokenizer.encode(&merged_text) {
            Ok(tokens) => tokens,
            Err(e) => {
                let err = SeqHookError::collaborator("tokenizer", "encode", &e);
                error!(parent_id, error = %err, "Failed to tokenize merged text");
                self.fail_sequence(parent_id, err.to_string(), now, report);
                return Err(err);
            }
        };

        let prefill_start_index = self.state.store.require_mut(parent_id)?.append_merged(&tokens);
        let plan = self.planner.plan(parent_id, prefill_start_index, self.cache.as_ref());
        if plan.degraded {
            let reclaimed = SeqHookError::ResourceReclaimedDuringBlock {
                seq_id: parent_id,
                prefix_len: prefill_start_index,
            };
            warn!(parent_id, error = %reclaimed, "Degraded resume");
            self.stats.degraded_resumes += 1;
            self.emit(LifecycleEvent::DegradedResume {
                seq_id: parent_id,
                prefix_len: prefill_start_index,
            });
            report.degraded.push(parent_id);
        }

        if let Err(e) = self.scheduler.mark_runnable(parent_id, plan.recompute_from) {
            let err = SeqHookError::collaborator("scheduler", "mark_runnable", &e);
            error!(parent_id, error = %err, "Scheduler failed to resume sequence");
            self.fail_sequence(parent_id, err.to_string(), now, report);
            return Err(err);
        }

        let record = MergeRecord {
            parent_id,
            merged_text,
            prefill_start_index,
            failed_children: results.iter().filter(|r| r.failed).map(|r| r.child_id).collect(),
            children: target.children,
            forced,
        };
        self.state.graph.commit_merge(record.clone());

        let still_active = self.state.graph.has_unmerged_children(parent_id);
        if let Some(parent) = self.state.store.get_mut(parent_id) {
            parent.set_parent_state(if still_active {
                ParentState::ParentActive
            } else {
                ParentState::Independent
            });
        }
        for child in &record.children {
            if let Some(seq) = self.state.store.get_mut(*child) {
                seq.set_child_state(ChildState::ChildMerged);
            }
            self.try_release(*child, report);
        }

        self.stats.merges += 1;
        if forced {
            self.stats.forced_unblocks += 1;
        }
        info!(
            parent_id,
            children = ?record.children,
            prefill_from = plan.recompute_from,
            appended = tokens.len(),
            forced,
            "Parent resumed with merged results"
        );
        self.emit(LifecycleEvent::ParentResumed {
            parent_id,
            merged_children: record.children.clone(),
            prefill_from: plan.recompute_from,
            forced,
        });
        report.resumed.push(ResumeDirective {
            seq_id: parent_id,
            prefill_from: plan.recompute_from,
            appended_tokens: tokens.len(),
            degraded: plan.degraded,
        });
        report.merges.push(record.clone());
        Ok(record)
    }

    /// Force-unblock parents that waited longer than `max_blocked_duration`.
    fn enforce_block_timeout(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(max) = self.config.limits.max_blocked_duration else {
            return;
        };
        let Ok(max) = chrono::Duration::from_std(max) else {
            return;
        };
        for parent_id in self.state.graph.blocked_before(now - max) {
            if self.state.store.status(parent_id) != Some(SequenceStatus::BlockedSync) {
                continue;
            }
            let dropped = self.state.graph.truncate_to_completed(parent_id);
            warn!(parent_id, dropped = ?dropped, "Sync timed out, resuming with completed children");
            if let Err(e) = self.merge_into(parent_id, true, now, report) {
                warn!(parent_id, error = %e, "Forced merge failed");
            }
        }
    }

    fn cancel_tree(&mut self, id: SequenceId, reason: FinishReason, now: DateTime<Utc>, report: &mut TickReport) {
        let mut targets = vec![id];
        targets.extend(self.state.store.descendants(id));

        for &target in &targets {
            if self.cancel_one(target, reason.clone(), report) {
                self.propagate_completion(target, "", true, now, report);
            }
        }
        for &target in &targets {
            self.try_release(target, report);
        }
    }

    /// Cancel live descendants of a sequence that has ended.
    fn orphan_descendants(&mut self, id: SequenceId, now: DateTime<Utc>, report: &mut TickReport) {
        for descendant in self.state.store.descendants(id) {
            if !self.state.store.is_live(descendant) {
                continue;
            }
            let parent = self
                .state
                .store
                .get(descendant)
                .and_then(|s| s.parent_id)
                .unwrap_or(id);
            let orphaned = SeqHookError::OrphanedChild {
                child: descendant,
                parent,
            };
            warn!(seq_id = descendant, error = %orphaned, "Cancelling orphaned child");
            if self.cancel_one(descendant, FinishReason::Orphaned, report) {
                self.stats.orphaned += 1;
                self.propagate_completion(descendant, "", true, now, report);
            }
        }
    }

    fn cancel_one(&mut self, id: SequenceId, reason: FinishReason, report: &mut TickReport) -> bool {
        let Some(seq) = self.state.store.get_mut(id) else {
            return false;
        };
        if seq.is_terminal() {
            return false;
        }
        let reason_text = format!("{:?}", reason);
        if let Err(e) = seq.terminate(SequenceStatus::Cancelled, reason) {
            warn!(seq_id = id, error = %e, "Cannot cancel sequence");
            return false;
        }
        seq.set_child_state(ChildState::ChildFinished);
        self.stats.cancellations += 1;
        info!(seq_id = id, reason = %reason_text, "Sequence cancelled");
        self.emit(LifecycleEvent::SequenceCancelled {
            seq_id: id,
            reason: reason_text,
        });
        report.cancelled.push(id);
        true
    }

    /// Release `id` once it is terminal and no live parent still needs its result.
    fn try_release(&mut self, id: SequenceId, report: &mut TickReport) {
        let Some(seq) = self.state.store.get(id) else {
            return;
        };
        if !seq.is_terminal() {
            return;
        }
        let awaited = match seq.parent_id {
            Some(parent) => self.state.store.is_live(parent) && !self.state.graph.is_merged(id),
            None => false,
        };
        if awaited {
            return;
        }
        self.release(id, report);
    }

    /// Release the children of a terminal sequence, then the sequence itself.
    fn release_subtree(&mut self, id: SequenceId, report: &mut TickReport) {
        let children = self
            .state
            .store
            .get(id)
            .map(|s| s.child_ids().to_vec())
            .unwrap_or_default();
        for child in children {
            self.try_release(child, report);
        }
        self.try_release(id, report);
    }

    fn release(&mut self, id: SequenceId, report: &mut TickReport) {
        let children = self
            .state
            .store
            .get(id)
            .map(|s| s.child_ids().to_vec())
            .unwrap_or_default();
        for child in children {
            self.try_release(child, report);
        }

        if self.scheduler.status(id) != Some(SchedulerState::Freed) {
            if let Err(e) = self.scheduler.free(id) {
                warn!(seq_id = id, error = %e, "Scheduler failed to free sequence");
            }
        }
        self.detector.clear(id);
        self.state.graph.forget(id);
        self.state.store.remove(id);
        self.stats.releases += 1;
        debug!(seq_id = id, "Sequence released");
        self.emit(LifecycleEvent::SequenceReleased { seq_id: id });
        report.released.push(id);
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.sinks.is_empty() {
            return;
        }
        let envelope = LifecycleEnvelope {
            version: EVENT_VERSION,
            sequence: next_sequence(),
            tick: self.tick,
            timestamp: now_ms(),
            event,
        };
        for sink in &self.sinks {
            sink.emit(&envelope);
        }
    }
}
