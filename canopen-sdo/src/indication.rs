//! Observer lists for application indications.

use crate::abort::AbortReason;

/// Answer of an indication that is allowed to defer its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done, continue the transfer.
    Ready,
    /// The application will answer later through the matching resume call.
    Pending,
}

pub type IndicationResult = Result<Completion, AbortReason>;

/// Handle of a registered observer, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u32);

/// Registered observers, called in registration order.
pub struct Observers<F: ?Sized> {
    list: Vec<(ObserverId, Box<F>)>,
}

impl<F: ?Sized> Observers<F> {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn register(&mut self, id: ObserverId, observer: Box<F>) {
        self.list.push((id, observer));
    }

    /// Drop the observer registered under `id`. Returns false if there is
    /// none.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.list.len();
        self.list.retain(|(registered, _)| *registered != id);
        self.list.len() != before
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Call every observer.
    pub fn notify(&mut self, mut call: impl FnMut(&mut F)) {
        for (_, observer) in self.list.iter_mut() {
            call(observer);
        }
    }

    /// Ask every observer. The answer is [`Completion::Pending`] if any of
    /// them deferred. A refusal stops the round and is returned as is.
    pub fn consult(&mut self, mut call: impl FnMut(&mut F) -> IndicationResult) -> IndicationResult {
        let mut answer = Completion::Ready;
        for (_, observer) in self.list.iter_mut() {
            if call(observer)? == Completion::Pending {
                answer = Completion::Pending;
            }
        }
        Ok(answer)
    }

    /// Ask observers that can only accept or veto.
    pub fn veto(&mut self, mut call: impl FnMut(&mut F) -> Result<(), AbortReason>) -> Result<(), AbortReason> {
        self.list.iter_mut().try_for_each(|(_, observer)| call(observer))
    }
}

impl<F: ?Sized> Default for Observers<F> {
    fn default() -> Self {
        Self::new()
    }
}
