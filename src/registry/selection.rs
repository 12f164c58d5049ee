//! Session auto-select policy.
//!
//! Given the old selection, a fresh session snapshot, the card filter and the
//! auto-focus and debug-mode flags, [`Selection::reconcile`] decides which
//! session is selected. Precedence, first match wins:
//!
//! 1. a pending one-shot focus request for exactly this client + session
//! 2. an empty snapshot clears the selection and leaves debug mode
//! 3. auto-focus (outside debug mode) picks the newest session passing the filter
//! 4. a selection that vanished or fails the filter is replaced the same way
//! 5. otherwise the selection is kept

use crate::protocol::{ClientId, Session, SessionId};

/// Inputs that shape auto-selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionOptions {
    /// Follow the newest session as sessions appear.
    pub auto_focus_latest: bool,
    /// Only sessions whose URL contains this text are eligible.
    pub card_filter: Option<String>,
}

impl SelectionOptions {
    fn passes(&self, session: &Session) -> bool {
        match self.card_filter.as_deref() {
            None | Some("") => true,
            Some(filter) => session.url.contains(filter),
        }
    }

    fn newest<'a>(&self, sessions: &'a [Session]) -> Option<&'a Session> {
        sessions
            .iter()
            .filter(|s| self.passes(s))
            .max_by_key(|s| s.id)
    }
}

/// Outcome of a selection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    /// Nothing changed.
    Unchanged,
    /// A session is now selected.
    Selected {
        /// Owning client.
        client: ClientId,
        /// Selected session.
        session: SessionId,
    },
    /// The selection was cleared.
    Cleared,
}

/// The front-end's current client/session selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    client: Option<ClientId>,
    session: Option<SessionId>,
    pending_focus: Option<(ClientId, SessionId)>,
    debug_mode: bool,
}

impl Selection {
    /// Empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selected client.
    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    /// Selected session.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Whether the device is in exclusive debug mode.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Enter or leave exclusive debug mode.
    pub fn set_debug_mode(&mut self, on: bool) {
        self.debug_mode = on;
    }

    /// Ask for `session` to be selected once it shows up in a snapshot.
    pub fn request_focus(&mut self, client: ClientId, session: SessionId) {
        self.pending_focus = Some((client, session));
    }

    /// Pending focus request, if any.
    pub fn pending_focus(&self) -> Option<(ClientId, SessionId)> {
        self.pending_focus
    }

    /// Select a session directly.
    pub fn select(&mut self, client: ClientId, session: SessionId) -> SelectionChange {
        self.set(client, Some(session))
    }

    /// Apply a new session snapshot for `client`.
    ///
    /// Snapshots for a client other than the selected one only matter when
    /// they satisfy a pending focus request.
    pub fn reconcile(
        &mut self,
        client: ClientId,
        sessions: &[Session],
        options: &SelectionOptions,
    ) -> SelectionChange {
        if let Some((focus_client, focus_session)) = self.pending_focus {
            if focus_client == client && sessions.iter().any(|s| s.id == focus_session) {
                self.pending_focus = None;
                return self.set(client, Some(focus_session));
            }
        }

        if self.client.is_some_and(|selected| selected != client) {
            return SelectionChange::Unchanged;
        }

        if sessions.is_empty() {
            self.debug_mode = false;
            return self.set(client, None);
        }

        let current_valid = self.session.is_some_and(|id| {
            sessions
                .iter()
                .any(|s| s.id == id && options.passes(s))
        });

        if (options.auto_focus_latest && !self.debug_mode) || !current_valid {
            let target = options.newest(sessions).map(|s| s.id);
            return self.set(client, target);
        }

        SelectionChange::Unchanged
    }

    /// Drop the selection if it points at a client that went away.
    pub fn on_client_removed(&mut self, client: ClientId) -> SelectionChange {
        if self.pending_focus.is_some_and(|(c, _)| c == client) {
            self.pending_focus = None;
        }
        if self.client != Some(client) {
            return SelectionChange::Unchanged;
        }
        let had_session = self.session.is_some();
        self.client = None;
        self.session = None;
        self.debug_mode = false;
        if had_session {
            SelectionChange::Cleared
        } else {
            SelectionChange::Unchanged
        }
    }

    fn set(&mut self, client: ClientId, session: Option<SessionId>) -> SelectionChange {
        let changed = self.client != Some(client) || self.session != session;
        let had_session = self.session.is_some();
        // A client without a selected session does not hold the selection
        self.client = session.map(|_| client);
        self.session = session;
        match session {
            Some(session) if changed => SelectionChange::Selected { client, session },
            None if had_session => SelectionChange::Cleared,
            _ => SelectionChange::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: ClientId = ClientId(1);

    fn sessions() -> Vec<Session> {
        vec![Session::new(5, "a"), Session::new(3, "b")]
    }

    fn auto(filter: Option<&str>) -> SelectionOptions {
        SelectionOptions {
            auto_focus_latest: true,
            card_filter: filter.map(String::from),
        }
    }

    #[test]
    fn test_auto_focus_picks_newest_then_filter() {
        let mut selection = Selection::new();
        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(None)),
            SelectionChange::Selected { client: C, session: 5 }
        );
        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(Some("b"))),
            SelectionChange::Selected { client: C, session: 3 }
        );
        assert_eq!(selection.session(), Some(3));
    }

    #[test]
    fn test_pending_focus_wins_once() {
        let mut selection = Selection::new();
        selection.request_focus(C, 3);
        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(None)),
            SelectionChange::Selected { client: C, session: 3 }
        );
        assert_eq!(selection.pending_focus(), None);

        // Next snapshot falls back to auto-focus
        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(None)),
            SelectionChange::Selected { client: C, session: 5 }
        );
    }

    #[test]
    fn test_pending_focus_waits_for_its_session() {
        let mut selection = Selection::new();
        selection.request_focus(C, 9);
        selection.reconcile(C, &sessions(), &auto(None));
        assert_eq!(selection.session(), Some(5));
        assert_eq!(selection.pending_focus(), Some((C, 9)));
    }

    #[test]
    fn test_empty_snapshot_clears_and_leaves_debug_mode() {
        let mut selection = Selection::new();
        selection.reconcile(C, &sessions(), &auto(None));
        selection.set_debug_mode(true);

        assert_eq!(selection.reconcile(C, &[], &auto(None)), SelectionChange::Cleared);
        assert_eq!(selection.session(), None);
        assert!(!selection.debug_mode());
    }

    #[test]
    fn test_debug_mode_keeps_valid_selection() {
        let mut selection = Selection::new();
        selection.select(C, 3);
        selection.set_debug_mode(true);

        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(None)),
            SelectionChange::Unchanged
        );
        assert_eq!(selection.session(), Some(3));
    }

    #[test]
    fn test_vanished_selection_is_replaced_without_auto_focus() {
        let mut selection = Selection::new();
        selection.select(C, 4);
        let options = SelectionOptions::default();

        assert_eq!(
            selection.reconcile(C, &sessions(), &options),
            SelectionChange::Selected { client: C, session: 5 }
        );
        // Still valid, so kept even though it is not the newest
        selection.select(C, 3);
        assert_eq!(selection.reconcile(C, &sessions(), &options), SelectionChange::Unchanged);
    }

    #[test]
    fn test_filter_with_no_match_clears() {
        let mut selection = Selection::new();
        selection.select(C, 5);
        assert_eq!(
            selection.reconcile(C, &sessions(), &auto(Some("zzz"))),
            SelectionChange::Cleared
        );
    }

    #[test]
    fn test_other_client_snapshot_is_ignored() {
        let mut selection = Selection::new();
        selection.select(C, 5);
        assert_eq!(
            selection.reconcile(ClientId(2), &[Session::new(9, "x")], &auto(None)),
            SelectionChange::Unchanged
        );
        assert_eq!(selection.client(), Some(C));
    }

    #[test]
    fn test_empty_snapshot_releases_client() {
        let mut selection = Selection::new();
        assert_eq!(selection.reconcile(C, &[], &auto(None)), SelectionChange::Unchanged);
        assert_eq!(selection.client(), None);

        let other = ClientId(2);
        assert_eq!(
            selection.reconcile(other, &[Session::new(7, "x")], &auto(None)),
            SelectionChange::Selected { client: other, session: 7 }
        );
    }

    #[test]
    fn test_filter_miss_releases_client() {
        let mut selection = Selection::new();
        selection.select(C, 5);
        selection.reconcile(C, &sessions(), &auto(Some("zzz")));
        assert_eq!(selection.client(), None);
    }

    #[test]
    fn test_client_removed_clears() {
        let mut selection = Selection::new();
        selection.select(C, 5);
        selection.set_debug_mode(true);
        assert_eq!(selection.on_client_removed(C), SelectionChange::Cleared);
        assert_eq!(selection.client(), None);
        assert!(!selection.debug_mode());
        assert_eq!(selection.on_client_removed(C), SelectionChange::Unchanged);
    }
}
