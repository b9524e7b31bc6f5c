/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Admission control for batch invoke requests.
//!
//! A batch invoke carries multiple `CommandDataIB`s, each optionally
//! tagged with a `CommandRef` so the initiator can correlate responses.
//! Before any command is dispatched, every entry is admitted into a
//! lookup table that rejects duplicate paths and duplicate refs; a
//! rejected entry invalidates the whole invoke, so a malformed batch
//! never executes partially.

use crate::error::{Error, ErrorCode};

use super::messages::CmdPath;
use super::CommandRef;

/// The maximum number of commands accepted in a single invoke request.
pub const MAX_PATHS_PER_INVOKE: usize = 8;

/// The paths and refs of the commands admitted so far for one invoke
/// transaction.
#[derive(Debug, Default)]
pub struct CommandRefLookupTable {
    entries: heapless::Vec<(CmdPath, Option<CommandRef>), MAX_PATHS_PER_INVOKE>,
}

impl CommandRefLookupTable {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the given path and ref collide with nothing admitted so far.
    ///
    /// A repeated path is always a collision. A repeated ref is a collision
    /// only when present; ref-less commands are legal in non-batch invokes
    /// and do not collide with each other.
    pub fn is_path_and_ref_unique(&self, path: &CmdPath, cmd_ref: Option<CommandRef>) -> bool {
        !self.entries.iter().any(|(known_path, known_ref)| {
            known_path == path || (cmd_ref.is_some() && *known_ref == cmd_ref)
        })
    }

    /// Admit one command into the transaction.
    ///
    /// Fails with `InvalidAction` on a path or ref collision and with
    /// `ResourceExhausted` when the batch exceeds the supported size.
    pub fn add(&mut self, path: CmdPath, cmd_ref: Option<CommandRef>) -> Result<(), Error> {
        if !self.is_path_and_ref_unique(&path, cmd_ref) {
            Err(ErrorCode::InvalidAction)?;
        }

        self.entries
            .push((path, cmd_ref))
            .map_err(|_| ErrorCode::ResourceExhausted.into())
    }

    /// The ref the initiator assigned to the given path, if any.
    pub fn get_ref(&self, path: &CmdPath) -> Option<CommandRef> {
        self.entries
            .iter()
            .find(|(known_path, _)| known_path == path)
            .and_then(|(_, cmd_ref)| *cmd_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(endpoint: u16, cmd: u32) -> CmdPath {
        CmdPath::new(Some(endpoint), Some(6), Some(cmd))
    }

    #[test]
    fn duplicate_path_rejected() {
        let mut table = CommandRefLookupTable::new();

        table.add(path(1, 0), Some(0)).unwrap();
        table.add(path(1, 1), Some(1)).unwrap();

        let err = table.add(path(1, 0), Some(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAction);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_ref_rejected() {
        let mut table = CommandRefLookupTable::new();

        table.add(path(1, 0), Some(7)).unwrap();

        let err = table.add(path(2, 0), Some(7)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAction);

        // Distinct refs on distinct paths are fine
        table.add(path(2, 0), Some(8)).unwrap();
        assert_eq!(table.get_ref(&path(2, 0)), Some(8));
    }

    #[test]
    fn missing_refs_do_not_collide() {
        let mut table = CommandRefLookupTable::new();

        table.add(path(1, 0), None).unwrap();
        table.add(path(2, 0), None).unwrap();

        assert_eq!(table.get_ref(&path(1, 0)), None);
    }

    #[test]
    fn capacity_overflow_is_resource_exhausted() {
        let mut table = CommandRefLookupTable::new();

        for i in 0..MAX_PATHS_PER_INVOKE {
            table.add(path(i as u16, 0), Some(i as u16)).unwrap();
        }

        let err = table
            .add(path(MAX_PATHS_PER_INVOKE as u16, 0), Some(99))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(table.len(), MAX_PATHS_PER_INVOKE);
    }
}
