use tracing::{error, info, warn};

use crate::domain::{FileRecord, FileState};
use crate::error::IngestError;
use crate::metadata::MetadataStore;

#[derive(Debug)]
pub enum Transition<T> {
    Completed(T),
    Diverted { state: FileState, error: IngestError },
}

impl<T> Transition<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Transition::Completed(_))
    }
}

pub fn revert_all(_: &IngestError) -> Option<FileState> {
    None
}

pub fn invalid_on_checksum(err: &IngestError) -> Option<FileState> {
    match err {
        IngestError::InvalidChecksum { .. } => Some(FileState::Invalid),
        _ => None,
    }
}

// On success `file` ends in `final_state`. An error the classifier maps
// moves it to the mapped state and comes back as `Transition::Diverted`.
// Any other error restores the entry state and is propagated.
pub fn scoped_transition<S, T, C, F>(
    store: &S,
    file: &mut FileRecord,
    intermediate: FileState,
    final_state: FileState,
    classify: C,
    body: F,
) -> Result<Transition<T>, IngestError>
where
    S: MetadataStore + ?Sized,
    C: Fn(&IngestError) -> Option<FileState>,
    F: FnOnce(&FileRecord) -> Result<T, IngestError>,
{
    let original = file.state;
    store.set_state(file.node_id, intermediate)?;
    file.state = intermediate;
    info!(node_id = %file.node_id, file = %file.file_name, from = %original, to = %intermediate, "state changed");

    match body(file) {
        Ok(value) => {
            store.set_state(file.node_id, final_state)?;
            file.state = final_state;
            info!(node_id = %file.node_id, file = %file.file_name, to = %final_state, "state changed");
            Ok(Transition::Completed(value))
        }
        Err(err) => match classify(&err) {
            Some(state) => {
                warn!(node_id = %file.node_id, file = %file.file_name, to = %state, error = %err, "state diverted");
                store.set_state(file.node_id, state)?;
                file.state = state;
                Ok(Transition::Diverted { state, error: err })
            }
            None => {
                match store.set_state(file.node_id, original) {
                    Ok(()) => {
                        file.state = original;
                        warn!(node_id = %file.node_id, file = %file.file_name, to = %original, error = %err, "state reverted");
                    }
                    Err(revert_err) => {
                        error!(node_id = %file.node_id, error = %revert_err, "failed to revert state");
                    }
                }
                Err(err)
            }
        },
    }
}
