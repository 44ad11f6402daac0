use crate::config::LockOptions;
use crate::error::{Result, SyslockError};
use crate::fsutil;
use crate::lock::counted::{CLockStatus, ExecutionCLock};
use crate::lock::exec::ExecutionLock;
use crate::process::ProcessIdentity;
use crate::reentrant::{EnterOutcome, ExitOutcome, ReentryState};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Whether a hook fires before or after the transition it describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

/// Observer hooks for run level transitions.
///
/// All methods default to no-ops; attach an implementation with
/// [`RunLevelLock::set_hooks`] to hang side effects off transitions
/// without altering the protocol.
pub trait RunLevelHooks<L> {
    fn on_level_change(&mut self, _current: &L, _target: &L, _phase: Phase) {}
    fn on_lock_invalid(&mut self, _phase: Phase) {}
    fn on_solo(&mut self, _going: bool, _phase: Phase) {}
    fn on_yield(&mut self, _phase: Phase) {}
}

/// Escalation requirement when going solo
#[derive(Debug, Clone)]
pub enum EnsureLevel<L> {
    /// Stay at the current level; error if it is below the solo threshold
    Keep,
    /// Escalate to the solo threshold level if below it
    SoloThreshold,
    /// Escalate to the given level if below it
    Level(L),
}

/// Solo threshold: disabled, or anchored at a real run level index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoloThreshold {
    Disabled,
    AtLevel(usize),
}

/// Declaration of a run level hierarchy.
///
/// `levels` lists the real run levels in ascending order with their
/// simultaneous-holder caps. The unlocked and base tokens must be
/// distinct from each other and from every real level.
#[derive(Debug, Clone)]
pub struct RunLevelSpec<L> {
    pub unlocked: L,
    pub base: L,
    pub levels: Vec<(L, u32)>,
    pub running_threshold: Option<L>,
    pub solo_threshold: Option<L>,
}

/// Advisory snapshot of a run level lock hierarchy.
///
/// `levels` is indexed like the internal level list (0 = unlocked,
/// 1 = base, 2.. = real levels); only real levels carry a status.
#[derive(Debug)]
pub struct RunLockStatus {
    pub processes: HashSet<ProcessIdentity>,
    pub levels: Vec<Option<CLockStatus>>,
    pub base_lockable: bool,
    pub solo_lockable: bool,
}

/// Layered run level coordinator over one base shared lock, one counted
/// lock per real level, a shared "running" lock and an exclusive "solo"
/// lock.
///
/// For a lock path `P` the underlying files are `P` (base), `P.k` for
/// real level k (1-indexed, with `P.k.swp` rewrite siblings), `P.r`
/// (running) and `P.s` (solo). Levels are always acquired strictly
/// ascending and released strictly descending, so peers agree on the
/// locking order. Entering the outer region acquires only the base
/// shared lock; real levels are taken on demand via [`set_level`]
/// (sticky) or [`with_level`] (scoped).
///
/// One peer may temporarily exclude all running peers by going solo:
/// it re-acquires the running lock exclusively while holding the solo
/// lock, and cooperating peers make that possible by calling
/// [`yield_to_solo`] at convenient points.
///
/// [`set_level`]: Self::set_level
/// [`with_level`]: Self::with_level
/// [`yield_to_solo`]: Self::yield_to_solo
pub struct RunLevelLock<L> {
    levels: Vec<L>,
    level_index: HashMap<L, usize>,
    running_index: usize,
    solo_threshold: SoloThreshold,
    options: LockOptions,
    path: Option<PathBuf>,
    base: ExecutionLock,
    counted: Vec<ExecutionCLock>,
    running: ExecutionLock,
    solo: ExecutionLock,
    last_set: usize,
    scope_requests: HashMap<u64, usize>,
    solo_last_set: bool,
    solo_scopes: HashMap<u64, bool>,
    next_token: u64,
    hooks: Option<Box<dyn RunLevelHooks<L> + Send>>,
    reentry: ReentryState,
}

impl<L> fmt::Debug for RunLevelLock<L>
where
    L: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLevelLock")
            .field("path", &self.path)
            .field("levels", &self.levels)
            .field("running_index", &self.running_index)
            .field("solo_threshold", &self.solo_threshold)
            .finish_non_exhaustive()
    }
}

impl<L> RunLevelLock<L>
where
    L: Clone + Eq + Hash + fmt::Debug + 'static,
{
    pub fn new(lock_path: Option<&Path>, spec: RunLevelSpec<L>, options: LockOptions) -> Result<Self> {
        options.validate()?;

        // Booleans and unit sentinels make equality-based level lookup
        // hazardous; reject the whole level type up front.
        if TypeId::of::<L>() == TypeId::of::<bool>() {
            return Err(SyslockError::invalid_config(
                "run levels must not have boolean values",
            ));
        }
        if TypeId::of::<L>() == TypeId::of::<()>() {
            return Err(SyslockError::invalid_config(
                "run levels must not be unit sentinels",
            ));
        }

        if spec.unlocked == spec.base {
            return Err(SyslockError::invalid_config(format!(
                "unlocked and base levels must not have the same value: {:?}",
                spec.unlocked
            )));
        }
        if spec.levels.iter().any(|(level, _)| *level == spec.unlocked) {
            return Err(SyslockError::invalid_config(format!(
                "run levels must not include the unlocked level: {:?}",
                spec.unlocked
            )));
        }
        if spec.levels.iter().any(|(level, _)| *level == spec.base) {
            return Err(SyslockError::invalid_config(format!(
                "run levels must not include the base level: {:?}",
                spec.base
            )));
        }
        if spec.levels.is_empty() {
            return Err(SyslockError::invalid_config(
                "need at least one real run level",
            ));
        }

        let mut levels = Vec::with_capacity(spec.levels.len() + 2);
        levels.push(spec.unlocked.clone());
        levels.push(spec.base.clone());
        levels.extend(spec.levels.iter().map(|(level, _)| level.clone()));

        let mut level_index = HashMap::with_capacity(levels.len());
        for (ilevel, level) in levels.iter().enumerate() {
            if level_index.insert(level.clone(), ilevel).is_some() {
                return Err(SyslockError::invalid_config(format!(
                    "duplicate run level value: {level:?}"
                )));
            }
        }

        let running_index = match &spec.running_threshold {
            None => 2,
            Some(level) => {
                let ilevel = level_index.get(level).copied();
                match ilevel {
                    Some(ilevel) if ilevel >= 1 => ilevel,
                    _ => {
                        return Err(SyslockError::invalid_config(format!(
                            "running threshold level must be a valid locked run level: {level:?}"
                        )));
                    }
                }
            }
        };

        let solo_threshold = match &spec.solo_threshold {
            None => SoloThreshold::Disabled,
            Some(level) => {
                let ilevel = level_index.get(level).copied();
                match ilevel {
                    Some(ilevel) if ilevel >= 2 => {
                        if ilevel < running_index {
                            return Err(SyslockError::invalid_config(format!(
                                "solo threshold level ({level:?}) must be greater or equal to the running threshold level ({:?})",
                                levels[running_index]
                            )));
                        }
                        SoloThreshold::AtLevel(ilevel)
                    }
                    _ => {
                        return Err(SyslockError::invalid_config(format!(
                            "solo threshold level, if given, must be a valid real run level: {level:?}"
                        )));
                    }
                }
            }
        };

        // Sub-locks share the coordinator's tunables; the coordinator
        // itself creates the lock directory once.
        let mut sub_options = options.clone();
        sub_options.makedirs = false;
        sub_options.lock_delay = Duration::ZERO;

        let mut base_options = sub_options.clone();
        base_options.shared_lock = true;
        let base = ExecutionLock::new(None, base_options.clone())?;
        let running = ExecutionLock::new(None, base_options)?;

        let mut solo_options = sub_options.clone();
        solo_options.shared_lock = false;
        let solo = ExecutionLock::new(None, solo_options)?;

        let counted = spec
            .levels
            .iter()
            .map(|(_, max_count)| ExecutionCLock::new(None, *max_count, sub_options.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut lock = Self {
            levels,
            level_index,
            running_index,
            solo_threshold,
            options,
            path: None,
            base,
            counted,
            running,
            solo,
            last_set: 0,
            scope_requests: HashMap::new(),
            solo_last_set: false,
            solo_scopes: HashMap::new(),
            next_token: 1,
            hooks: None,
            reentry: ReentryState::default(),
        };
        lock.set_lock_path(lock_path)?;
        Ok(lock)
    }

    /// Point the hierarchy at a new base path. Only permitted while the
    /// base lock is not held.
    pub fn set_lock_path(&mut self, lock_path: Option<&Path>) -> Result<()> {
        if self.locked() {
            return Err(SyslockError::invalid_state(format!(
                "cannot set lock path while locked: tried {:?} -> {:?}",
                self.path, lock_path
            )));
        }

        match lock_path {
            None => {
                self.path = None;
                self.base.set_lock_path(None)?;
                for clock in &mut self.counted {
                    clock.set_lock_path(None)?;
                }
                self.running.set_lock_path(None)?;
                self.solo.set_lock_path(None)?;
            }
            Some(lock_path) => {
                let resolved = self.options.resolve(lock_path);
                if self.options.makedirs {
                    fsutil::create_lock_dir(&resolved, self.options.dir_mode, self.options.umask)
                        .map_err(|e| {
                            SyslockError::io_error(
                                format!(
                                    "Failed to create lock directory for {}",
                                    resolved.display()
                                ),
                                e,
                            )
                        })?;
                }
                self.base.set_lock_path(Some(&resolved))?;
                for (i, clock) in self.counted.iter_mut().enumerate() {
                    clock.set_lock_path(Some(&path_with_suffix(&resolved, &format!(".{}", i + 1))))?;
                }
                self.running
                    .set_lock_path(Some(&path_with_suffix(&resolved, ".r")))?;
                self.solo
                    .set_lock_path(Some(&path_with_suffix(&resolved, ".s")))?;
                self.path = Some(resolved);
            }
        }
        Ok(())
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn RunLevelHooks<L> + Send>) {
        self.hooks = Some(hooks);
    }

    #[must_use]
    pub fn lock_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn lock_valid(&self) -> bool {
        self.path.is_some()
    }

    /// Whether the base shared lock is held
    #[must_use]
    pub fn locked(&self) -> bool {
        self.base.locked()
    }

    /// Whether this instance is allowed to go solo. Peers that cannot go
    /// solo must still yield to peers that can.
    #[must_use]
    pub const fn solo_enabled(&self) -> bool {
        matches!(self.solo_threshold, SoloThreshold::AtLevel(_))
    }

    /// Whether the current level already satisfies the solo threshold
    #[must_use]
    pub fn solo_possible(&self) -> bool {
        match self.solo_threshold {
            SoloThreshold::Disabled => false,
            SoloThreshold::AtLevel(ilevel) => self.counted[ilevel - 2].locked(),
        }
    }

    /// Solo threshold level; the lowest real level when solo is disabled
    #[must_use]
    pub fn solo_threshold_level(&self) -> &L {
        let ilevel = match self.solo_threshold {
            SoloThreshold::Disabled => 2,
            SoloThreshold::AtLevel(ilevel) => ilevel,
        };
        &self.levels[ilevel]
    }

    #[must_use]
    pub fn is_solo(&self) -> bool {
        self.solo.locked()
    }

    #[must_use]
    pub fn running_threshold_level(&self) -> &L {
        &self.levels[self.running_index]
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.running.locked()
    }

    /// Highest level k such that levels 1..=k are all held locally
    #[must_use]
    pub fn current_level(&self) -> &L {
        &self.levels[self.current_ilevel()]
    }

    /// Whether the given level (and hence all below it) is held
    pub fn current_level_satisfies(&self, level: &L) -> Result<bool> {
        let ilevel = self.ilevel_of(level)?;
        Ok(match ilevel {
            0 => true,
            1 => self.base.locked(),
            _ => self.counted[ilevel - 2].locked(),
        })
    }

    /// Real run levels in ascending order
    #[must_use]
    pub fn run_levels(&self) -> &[L] {
        &self.levels[2..]
    }

    /// Current holder caps per real run level
    #[must_use]
    pub fn max_counts(&self) -> Vec<(L, u32)> {
        self.levels[2..]
            .iter()
            .zip(&self.counted)
            .map(|(level, clock)| (level.clone(), clock.max_count()))
            .collect()
    }

    /// Change holder caps for the given real levels.
    ///
    /// With `error_if_locked`, changing the cap of a held level errors
    /// unless `allow_raise` is set and the change is an increase.
    pub fn update_max_counts(
        &mut self,
        changes: &[(L, u32)],
        error_if_locked: bool,
        allow_raise: bool,
    ) -> Result<()> {
        for (level, max_count) in changes {
            let ilevel = self.ilevel_of(level)?;
            if ilevel < 2 {
                return Err(SyslockError::invalid_config(format!(
                    "only real run levels have counted caps: {level:?}"
                )));
            }
            let clock = &mut self.counted[ilevel - 2];
            if error_if_locked
                && clock.locked()
                && *max_count != clock.max_count()
                && (*max_count < clock.max_count() || !allow_raise)
            {
                return Err(SyslockError::invalid_state(format!(
                    "invalid requested change to max count while counted lock is locked ({} -> {}): {:?}",
                    clock.max_count(),
                    max_count,
                    clock.lock_path()
                )));
            }
            clock.set_max_count(*max_count)?;
        }
        Ok(())
    }

    /// Enter the outer region: acquire the base shared lock (reentrant)
    pub fn enter(&mut self) -> Result<()> {
        match self.reentry.on_enter() {
            EnterOutcome::Passthrough => self.base.enter(),
            EnterOutcome::Nested => Ok(()),
            EnterOutcome::First => {
                let res = self.base.enter();
                self.reentry.enter_done(res.is_ok());
                res
            }
        }
    }

    /// Leave the outer region: release running, solo and every level
    /// including base (reentrant; only the outermost exit releases)
    pub fn exit(&mut self) -> Result<()> {
        match self.reentry.on_exit()? {
            ExitOutcome::Passthrough => self.release_all(),
            ExitOutcome::Nested => Ok(()),
            ExitOutcome::Last => {
                let res = self.release_all();
                self.reentry.exit_done();
                res
            }
        }
    }

    fn release_all(&mut self) -> Result<()> {
        self.set_running(false, false)?;
        self.end_solo_internal(None, false)?;
        self.set_ilevel_internal(Some(0), None, false)
    }

    /// Run `f` inside the outer region; released on all return paths
    pub fn with_locked<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let out = f(self);
        let exit_res = self.exit();
        match out {
            Ok(value) => exit_res.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Set the sticky run level; escalates/de-escalates as needed
    pub fn set_level(&mut self, level: &L) -> Result<()> {
        let ilevel = self.ilevel_of(level)?;
        self.set_ilevel_internal(Some(ilevel), None, true)
    }

    /// Run `f` with at least the given level held. The effective level is
    /// the maximum over the sticky level and every active scope.
    pub fn with_level<T>(
        &mut self,
        level: &L,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let ilevel = self.ilevel_of(level)?;
        let token = self.alloc_token();
        if let Err(e) = self.set_ilevel_internal(Some(ilevel), Some(token), true) {
            self.scope_requests.remove(&token);
            return Err(e);
        }
        let out = f(self);
        let cleanup = self.set_ilevel_internal(None, Some(token), true);
        match out {
            Ok(value) => cleanup.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Go solo: exclude every other running peer until [`end_solo`].
    ///
    /// Requires the effective level to be at least the solo threshold,
    /// escalating first per `ensure`. While solo, level changes error.
    ///
    /// [`end_solo`]: Self::end_solo
    pub fn go_solo(&mut self, ensure: EnsureLevel<L>) -> Result<()> {
        self.go_solo_internal(ensure, None)
    }

    pub fn end_solo(&mut self) -> Result<()> {
        self.end_solo_internal(None, true)
    }

    /// Run `f` in solo mode; solo ends on all return paths
    pub fn with_solo<T>(
        &mut self,
        ensure: EnsureLevel<L>,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let token = self.alloc_token();
        if let Err(e) = self.go_solo_internal(ensure, Some(token)) {
            self.solo_scopes.remove(&token);
            self.scope_requests.remove(&token);
            return Err(e);
        }
        let out = f(self);
        let cleanup = self.end_solo_internal(Some(token), true);
        match out {
            Ok(value) => cleanup.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Whether some peer currently holds solo exclusive while we hold
    /// running: the signal that we should yield.
    pub fn solo_pending(&mut self) -> Result<bool> {
        if self.solo.locked() || !self.running.locked() {
            return Ok(false);
        }
        Ok(!self.solo.test_lockable(Some(true))?)
    }

    /// Cooperatively let a pending solo peer through: drop running, wait
    /// for the solo lock to clear, re-acquire running shared.
    pub fn yield_to_solo(&mut self) -> Result<()> {
        if self.solo.locked() || !self.running.locked() {
            return Ok(());
        }

        self.run_hook_yield(Phase::Before);
        self.set_running(false, false)?;
        self.solo.touch_lock(Some(true))?;
        self.set_running(true, false)?;
        self.run_hook_yield(Phase::After);

        // Give the solo peer a head start before we next contend
        thread::sleep(self.options.check_interval);
        Ok(())
    }

    /// Advisory status across the hierarchy, up to `max_level` when given
    pub fn lock_status(&mut self, max_level: Option<&L>) -> Result<RunLockStatus> {
        let max_ilevel = match max_level {
            None => self.levels.len() - 1,
            Some(level) => self.ilevel_of(level)?,
        };

        let base_lockable = self.base.test_lockable(None)?;
        let solo_lockable = self.solo.test_lockable(Some(true))?;

        let mut processes = HashSet::new();
        let mut levels = vec![None; self.levels.len()];
        for ilevel in 2..=max_ilevel.min(self.levels.len() - 1) {
            let status = self.counted[ilevel - 2].lock_status()?;
            processes.extend(status.processes.iter().copied());
            levels[ilevel] = Some(status);
        }

        Ok(RunLockStatus {
            processes,
            levels,
            base_lockable,
            solo_lockable,
        })
    }

    fn ilevel_of(&self, level: &L) -> Result<usize> {
        self.level_index.get(level).copied().ok_or_else(|| {
            SyslockError::invalid_config(format!("unknown run level value: {level:?}"))
        })
    }

    fn alloc_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn current_ilevel(&self) -> usize {
        if !self.base.locked() {
            return 0;
        }
        let mut ilevel = 1;
        for clock in &self.counted {
            if clock.locked() {
                ilevel += 1;
            } else {
                break;
            }
        }
        ilevel
    }

    fn lock_locked(&self, ilevel: usize) -> bool {
        if ilevel == 1 {
            self.base.locked()
        } else {
            self.counted[ilevel - 2].locked()
        }
    }

    fn lock_valid_at(&self, ilevel: usize) -> bool {
        if ilevel == 1 {
            self.base.lock_valid()
        } else {
            self.counted[ilevel - 2].lock_valid()
        }
    }

    fn lock_enter(&mut self, ilevel: usize) -> Result<()> {
        if ilevel == 1 {
            self.base.enter()
        } else {
            self.counted[ilevel - 2].enter()
        }
    }

    fn lock_exit(&mut self, ilevel: usize) -> Result<()> {
        if ilevel == 1 {
            self.base.exit()
        } else {
            self.counted[ilevel - 2].exit()
        }
    }

    /// Core escalation/de-escalation machinery.
    ///
    /// The effective target is the maximum of the sticky level and every
    /// active scope request. Releases run strictly descending and
    /// acquisitions strictly ascending; a mid-escalation failure releases
    /// everything this call acquired before propagating.
    fn set_ilevel_internal(
        &mut self,
        ilevel: Option<usize>,
        scope: Option<u64>,
        manage_running: bool,
    ) -> Result<()> {
        let num_levels = self.levels.len();
        if ilevel.is_none() && scope.is_none() {
            return Err(SyslockError::invalid_state("invalid requested run level"));
        }
        if let Some(ilevel) = ilevel {
            if ilevel >= num_levels {
                return Err(SyslockError::invalid_state(format!(
                    "invalid requested run level index: {ilevel}"
                )));
            }
            if ilevel > 0 && self.reentry.count() == 0 {
                return Err(SyslockError::invalid_state(format!(
                    "need to enter the run level lock before setting a locked run level: {:?}",
                    self.levels[ilevel]
                )));
            }
        }

        match scope {
            None => {
                self.last_set = ilevel.unwrap_or(0);
                self.scope_requests.clear();
            }
            Some(token) => match ilevel {
                None => {
                    self.scope_requests.remove(&token);
                }
                Some(ilevel) => {
                    self.scope_requests.insert(token, ilevel);
                }
            },
        }

        let new_ilevel = self
            .last_set
            .max(self.scope_requests.values().copied().max().unwrap_or(0));
        let cur_ilevel = self.current_ilevel();

        self.run_hook_level_change(cur_ilevel, new_ilevel, Phase::Before);

        if self.solo.locked() {
            if new_ilevel != cur_ilevel {
                return Err(SyslockError::invalid_state(
                    "run level cannot be changed in solo mode",
                ));
            }
            self.run_hook_level_change(cur_ilevel, new_ilevel, Phase::After);
            return Ok(());
        }

        if manage_running {
            self.set_running(false, false)?;
        }

        // Strictly descending releases
        for ilevel in ((new_ilevel + 1)..num_levels).rev() {
            if self.lock_locked(ilevel) {
                self.lock_exit(ilevel)?;
            }
        }

        // Strictly ascending acquisitions, rolled back on failure
        let mut newly_acquired: Vec<usize> = Vec::new();
        let mut was_invalid = false;
        let mut escalation: Result<()> = Ok(());
        for ilevel in 1..=new_ilevel {
            if self.lock_locked(ilevel) {
                continue;
            }
            if !self.lock_valid_at(ilevel) {
                was_invalid = true;
                self.run_hook_lock_invalid(Phase::Before);
            }
            if let Err(e) = self.lock_enter(ilevel) {
                escalation = Err(e);
                break;
            }
            newly_acquired.push(ilevel);
            if ilevel == 2 && !self.options.lock_delay.is_zero() {
                thread::sleep(self.options.lock_delay);
            }
        }
        if let Err(e) = escalation {
            for &ilevel in newly_acquired.iter().rev() {
                let _ = self.lock_exit(ilevel);
            }
            return Err(e);
        }
        if was_invalid {
            self.run_hook_lock_invalid(Phase::After);
        }

        if manage_running && new_ilevel >= self.running_index {
            self.set_running(true, false)?;
        }

        debug!(
            current = ?self.levels[cur_ilevel],
            target = ?self.levels[new_ilevel],
            "run level transition complete"
        );
        self.run_hook_level_change(cur_ilevel, new_ilevel, Phase::After);
        Ok(())
    }

    fn set_running(&mut self, running: bool, exclusive: bool) -> Result<()> {
        if running {
            if !self.running.locked() && !thread::panicking() {
                self.running.set_shared(!exclusive)?;
                self.running.enter()?;
            }
        } else if self.running.locked() {
            self.running.exit()?;
        }
        Ok(())
    }

    fn go_solo_internal(&mut self, ensure: EnsureLevel<L>, scope: Option<u64>) -> Result<()> {
        let solo_index = match self.solo_threshold {
            SoloThreshold::Disabled => {
                return Err(SyslockError::invalid_state(
                    "solo mode is disabled, cannot go solo",
                ));
            }
            SoloThreshold::AtLevel(ilevel) => ilevel,
        };

        match scope {
            None => {
                self.solo_last_set = true;
                self.solo_scopes.clear();
            }
            Some(token) => {
                self.solo_scopes.insert(token, true);
            }
        }

        if self.solo.locked() {
            return Ok(());
        }

        let mut new_ilevel = self.current_ilevel();
        match ensure {
            EnsureLevel::Keep => {}
            EnsureLevel::SoloThreshold => {
                if new_ilevel < solo_index {
                    new_ilevel = solo_index;
                }
            }
            EnsureLevel::Level(level) => {
                let ilevel = self.ilevel_of(&level)?;
                if new_ilevel < ilevel {
                    new_ilevel = ilevel;
                }
            }
        }
        if new_ilevel < solo_index {
            return Err(SyslockError::invalid_state(format!(
                "run level needs to be at least {:?} in order to go solo, wanted to do it at {:?}",
                self.levels[solo_index], self.levels[new_ilevel]
            )));
        }

        self.set_running(false, false)?;
        self.set_ilevel_internal(Some(new_ilevel), scope, false)?;

        self.run_hook_solo(true, Phase::Before);

        self.solo.set_shared(false)?;
        self.solo.enter()?;
        if let Err(e) = self.set_running(true, true) {
            let _ = self.solo.exit();
            return Err(e);
        }

        if !self.options.lock_delay.is_zero() {
            thread::sleep(self.options.lock_delay);
        }

        debug!(level = ?self.levels[new_ilevel], "went solo");
        self.run_hook_solo(true, Phase::After);
        Ok(())
    }

    fn end_solo_internal(&mut self, scope: Option<u64>, manage_running: bool) -> Result<()> {
        match scope {
            None => {
                self.solo_last_set = false;
                self.solo_scopes.clear();
            }
            Some(token) => {
                self.solo_scopes.remove(&token);
            }
        }

        if self.solo_last_set || self.solo_scopes.values().any(|&wanted| wanted) {
            return Ok(());
        }
        if !self.solo.locked() {
            return Ok(());
        }

        self.run_hook_solo(false, Phase::Before);

        if manage_running {
            self.set_running(false, false)?;
        }
        self.solo.exit()?;

        if let Some(token) = scope {
            self.set_ilevel_internal(None, Some(token), manage_running)?;
        } else if manage_running && self.current_ilevel() >= self.running_index {
            self.set_running(true, false)?;
        }

        debug!("solo ended");
        self.run_hook_solo(false, Phase::After);
        Ok(())
    }

    fn run_hook_level_change(&mut self, cur_ilevel: usize, new_ilevel: usize, phase: Phase) {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_level_change(&self.levels[cur_ilevel], &self.levels[new_ilevel], phase);
        }
    }

    fn run_hook_lock_invalid(&mut self, phase: Phase) {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_lock_invalid(phase);
        }
    }

    fn run_hook_solo(&mut self, going: bool, phase: Phase) {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_solo(going, phase);
        }
    }

    fn run_hook_yield(&mut self, phase: Phase) {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_yield(phase);
        }
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut buf = path.to_path_buf().into_os_string();
    buf.push(suffix);
    PathBuf::from(buf)
}
