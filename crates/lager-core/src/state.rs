//! Record lifecycle state machine.
//!
//! Every state is a flat variant and every `(state, event)` pair is spelled out
//! in [`RecordState::transition`]; there is no catch-all arm, so adding a state
//! or an event does not compile until the table covers it.

use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Known identity, no data.
    Empty,
    /// The last fetch of an empty identity failed. Retriable.
    EmptyError,
    /// Blocking fetch in flight for an empty identity.
    Loading,
    /// Clean and persisted.
    Saved,
    CreatedUncommitted,
    CreatedInvalid,
    CreatedSaving,
    UpdatedUncommitted,
    UpdatedInvalid,
    UpdatedSaving,
    DeletedUncommitted,
    DeletedSaving,
    /// Terminal: the server acknowledged the delete (or the record was never saved).
    DeletedSaved,
    DeletedInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    FetchStarted,
    FetchSucceeded,
    FetchFailed,
    /// Server data arrived outside of a fetch of this record.
    Pushed,
    /// A local attribute or relationship change.
    Mutated,
    /// Every locally changed attribute is back at its persisted value.
    Reverted,
    /// The error ledger went from empty to non-empty.
    BecameInvalid,
    /// The error ledger went from non-empty to empty.
    BecameValid,
    SaveStarted,
    SaveSucceeded,
    /// The transport rejected the write as invalid.
    SaveRejected,
    /// Generic save failure, edits are kept.
    SaveFailed,
    DeleteRequested,
    RolledBack,
    Unloaded,
}

impl StateEvent {
    pub const ALL: [StateEvent; 15] = [
        StateEvent::FetchStarted,
        StateEvent::FetchSucceeded,
        StateEvent::FetchFailed,
        StateEvent::Pushed,
        StateEvent::Mutated,
        StateEvent::Reverted,
        StateEvent::BecameInvalid,
        StateEvent::BecameValid,
        StateEvent::SaveStarted,
        StateEvent::SaveSucceeded,
        StateEvent::SaveRejected,
        StateEvent::SaveFailed,
        StateEvent::DeleteRequested,
        StateEvent::RolledBack,
        StateEvent::Unloaded,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StateEvent::FetchStarted => "fetchStarted",
            StateEvent::FetchSucceeded => "fetchSucceeded",
            StateEvent::FetchFailed => "fetchFailed",
            StateEvent::Pushed => "pushedData",
            StateEvent::Mutated => "didSetProperty",
            StateEvent::Reverted => "propertyWasReset",
            StateEvent::BecameInvalid => "becameInvalid",
            StateEvent::BecameValid => "becameValid",
            StateEvent::SaveStarted => "willCommit",
            StateEvent::SaveSucceeded => "didCommit",
            StateEvent::SaveRejected => "becameInvalidOnCommit",
            StateEvent::SaveFailed => "becameError",
            StateEvent::DeleteRequested => "deleteRecord",
            StateEvent::RolledBack => "rolledBack",
            StateEvent::Unloaded => "unloadRecord",
        }
    }
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl RecordState {
    pub const ALL: [RecordState; 14] = [
        RecordState::Empty,
        RecordState::EmptyError,
        RecordState::Loading,
        RecordState::Saved,
        RecordState::CreatedUncommitted,
        RecordState::CreatedInvalid,
        RecordState::CreatedSaving,
        RecordState::UpdatedUncommitted,
        RecordState::UpdatedInvalid,
        RecordState::UpdatedSaving,
        RecordState::DeletedUncommitted,
        RecordState::DeletedSaving,
        RecordState::DeletedSaved,
        RecordState::DeletedInvalid,
    ];

    /// Hierarchical state name.
    pub fn name(self) -> &'static str {
        match self {
            RecordState::Empty => "root.empty",
            RecordState::EmptyError => "root.empty.error",
            RecordState::Loading => "root.loaded.loading",
            RecordState::Saved => "root.loaded.saved",
            RecordState::CreatedUncommitted => "root.loaded.created.uncommitted",
            RecordState::CreatedInvalid => "root.loaded.created.invalid",
            RecordState::CreatedSaving => "root.loaded.created.saving",
            RecordState::UpdatedUncommitted => "root.loaded.updated.uncommitted",
            RecordState::UpdatedInvalid => "root.loaded.updated.invalid",
            RecordState::UpdatedSaving => "root.loaded.updated.saving",
            RecordState::DeletedUncommitted => "root.loaded.deleted.uncommitted",
            RecordState::DeletedSaving => "root.loaded.deleted.saving",
            RecordState::DeletedSaved => "root.loaded.deleted.saved",
            RecordState::DeletedInvalid => "root.loaded.deleted.invalid",
        }
    }

    /// No data is available yet.
    pub fn is_empty(self) -> bool {
        matches!(
            self,
            RecordState::Empty | RecordState::EmptyError | RecordState::Loading
        )
    }

    pub fn is_loading(self) -> bool {
        self == RecordState::Loading
    }

    pub fn is_loaded(self) -> bool {
        !self.is_empty()
    }

    pub fn is_error(self) -> bool {
        self == RecordState::EmptyError
    }

    pub fn is_new(self) -> bool {
        matches!(
            self,
            RecordState::CreatedUncommitted
                | RecordState::CreatedInvalid
                | RecordState::CreatedSaving
        )
    }

    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            RecordState::DeletedUncommitted
                | RecordState::DeletedSaving
                | RecordState::DeletedSaved
                | RecordState::DeletedInvalid
        )
    }

    pub fn is_saving(self) -> bool {
        matches!(
            self,
            RecordState::CreatedSaving | RecordState::UpdatedSaving | RecordState::DeletedSaving
        )
    }

    pub fn is_valid(self) -> bool {
        !matches!(
            self,
            RecordState::CreatedInvalid | RecordState::UpdatedInvalid | RecordState::DeletedInvalid
        )
    }

    pub fn is_dirty(self) -> bool {
        self.is_new()
            || matches!(
                self,
                RecordState::UpdatedUncommitted
                    | RecordState::UpdatedInvalid
                    | RecordState::UpdatedSaving
                    | RecordState::DeletedUncommitted
                    | RecordState::DeletedSaving
                    | RecordState::DeletedInvalid
            )
    }

    /// Whether the record shows up in live record arrays.
    pub fn is_visible(self) -> bool {
        self.is_loaded() && self != RecordState::DeletedSaved
    }

    /// Apply `event`, returning the next state or the rejected pair.
    pub fn transition(self, event: StateEvent) -> Result<RecordState, TransitionError> {
        use RecordState as S;
        use StateEvent as E;

        let next = match self {
            S::Empty | S::EmptyError => match event {
                E::FetchStarted => S::Loading,
                E::Pushed => S::Saved,
                E::Unloaded => S::Empty,
                E::FetchSucceeded
                | E::FetchFailed
                | E::Mutated
                | E::Reverted
                | E::BecameInvalid
                | E::BecameValid
                | E::SaveStarted
                | E::SaveSucceeded
                | E::SaveRejected
                | E::SaveFailed
                | E::DeleteRequested
                | E::RolledBack => return Err(self.reject(event)),
            },
            S::Loading => match event {
                E::FetchStarted => S::Loading,
                E::FetchSucceeded | E::Pushed => S::Saved,
                E::FetchFailed => S::EmptyError,
                E::Unloaded => S::Empty,
                E::Mutated
                | E::Reverted
                | E::BecameInvalid
                | E::BecameValid
                | E::SaveStarted
                | E::SaveSucceeded
                | E::SaveRejected
                | E::SaveFailed
                | E::DeleteRequested
                | E::RolledBack => return Err(self.reject(event)),
            },
            S::Saved => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => S::Saved,
                E::Mutated => S::UpdatedUncommitted,
                E::Reverted | E::BecameValid | E::RolledBack => S::Saved,
                E::BecameInvalid => S::UpdatedInvalid,
                E::SaveStarted => S::UpdatedSaving,
                E::DeleteRequested => S::DeletedUncommitted,
                E::Unloaded => S::Empty,
                E::SaveSucceeded | E::SaveRejected | E::SaveFailed => {
                    return Err(self.reject(event))
                }
            },
            S::CreatedUncommitted | S::CreatedInvalid => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                E::Mutated | E::Reverted => self,
                E::BecameInvalid => S::CreatedInvalid,
                E::BecameValid => S::CreatedUncommitted,
                E::SaveStarted => S::CreatedSaving,
                E::DeleteRequested | E::RolledBack => S::DeletedSaved,
                E::Unloaded => S::Empty,
                E::SaveSucceeded | E::SaveRejected | E::SaveFailed => {
                    return Err(self.reject(event))
                }
            },
            S::UpdatedUncommitted => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                E::Mutated | E::BecameValid => S::UpdatedUncommitted,
                E::Reverted | E::RolledBack => S::Saved,
                E::BecameInvalid => S::UpdatedInvalid,
                E::SaveStarted => S::UpdatedSaving,
                E::DeleteRequested => S::DeletedUncommitted,
                E::Unloaded => S::Empty,
                E::SaveSucceeded | E::SaveRejected | E::SaveFailed => {
                    return Err(self.reject(event))
                }
            },
            S::UpdatedInvalid => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                // Invalidity is only left through the error ledger.
                E::Mutated | E::Reverted | E::BecameInvalid => S::UpdatedInvalid,
                E::BecameValid => S::UpdatedUncommitted,
                E::RolledBack => S::Saved,
                E::SaveStarted => S::UpdatedSaving,
                E::DeleteRequested => S::DeletedUncommitted,
                E::Unloaded => S::Empty,
                E::SaveSucceeded | E::SaveRejected | E::SaveFailed => {
                    return Err(self.reject(event))
                }
            },
            S::CreatedSaving | S::UpdatedSaving | S::DeletedSaving => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                // Settled by the outcome of the save.
                E::BecameInvalid | E::BecameValid => self,
                E::SaveSucceeded => match self {
                    S::DeletedSaving => S::DeletedSaved,
                    _ => S::Saved,
                },
                E::SaveRejected => match self {
                    S::CreatedSaving => S::CreatedInvalid,
                    S::UpdatedSaving => S::UpdatedInvalid,
                    _ => S::DeletedInvalid,
                },
                E::SaveFailed => match self {
                    S::CreatedSaving => S::CreatedUncommitted,
                    S::UpdatedSaving => S::UpdatedUncommitted,
                    _ => S::DeletedUncommitted,
                },
                E::Mutated
                | E::Reverted
                | E::SaveStarted
                | E::DeleteRequested
                | E::RolledBack
                | E::Unloaded => return Err(self.reject(event)),
            },
            S::DeletedUncommitted | S::DeletedInvalid => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                E::Reverted | E::DeleteRequested => self,
                E::BecameInvalid => S::DeletedInvalid,
                E::BecameValid => S::DeletedUncommitted,
                E::SaveStarted => S::DeletedSaving,
                E::RolledBack => S::Saved,
                E::Unloaded => S::Empty,
                E::Mutated | E::SaveSucceeded | E::SaveRejected | E::SaveFailed => {
                    return Err(self.reject(event))
                }
            },
            S::DeletedSaved => match event {
                E::FetchStarted | E::FetchSucceeded | E::FetchFailed | E::Pushed => self,
                E::DeleteRequested => self,
                E::Unloaded => S::Empty,
                E::Mutated
                | E::Reverted
                | E::BecameInvalid
                | E::BecameValid
                | E::SaveStarted
                | E::SaveSucceeded
                | E::SaveRejected
                | E::SaveFailed
                | E::RolledBack => return Err(self.reject(event)),
            },
        };

        Ok(next)
    }

    fn reject(self, event: StateEvent) -> TransitionError {
        TransitionError { state: self, event }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
