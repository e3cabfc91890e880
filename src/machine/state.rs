/// Per-instance bookkeeping for the cooperative handler.
///
/// `requested` is a next state the handler asked for that the live document
/// has not shown yet; `from` is where it was asked from. `last_observed` is
/// the state the previous handler run saw, which the transition predicates
/// compare against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateTracker {
    requested: Option<String>,
    from: Option<String>,
    last_observed: Option<String>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// False while a requested state has not landed and the document still
    /// shows the state it was requested from. A document moved elsewhere by
    /// a peer counts as ready.
    pub fn is_ready(&self, current: Option<&str>) -> bool {
        match &self.requested {
            None => true,
            Some(next) => current == Some(next.as_str()) || current != self.from.as_deref(),
        }
    }

    /// Records the handler's decision to leave `current` for `next`.
    pub fn request(&mut self, current: Option<&str>, next: &str) {
        if current == Some(next) {
            return;
        }
        self.requested = Some(next.to_string());
        self.from = current.map(str::to_string);
    }

    /// Called after each handler run with the state it ran in.
    pub fn observe(&mut self, current: Option<&str>) {
        self.last_observed = current.map(str::to_string);
        if self.is_ready(current) {
            self.requested = None;
            self.from = None;
        }
    }

    /// Forgets everything, as on a fresh mount.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    pub fn last_observed(&self) -> Option<&str> {
        self.last_observed.as_deref()
    }

    pub fn transition(&self, current: Option<&str>) -> bool {
        current != self.last_observed.as_deref()
    }

    /// Entered `state` since the last run.
    pub fn transition_to(&self, current: Option<&str>, state: &str) -> bool {
        current == Some(state) && self.last_observed.as_deref() != Some(state)
    }

    /// Left `state` since the last run.
    pub fn transition_from(&self, current: Option<&str>, state: &str) -> bool {
        current != Some(state) && self.last_observed.as_deref() == Some(state)
    }
}
