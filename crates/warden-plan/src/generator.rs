//! Event generators.

use warden_event::{
    CommandSpec, EmitHandler, Emission, EventScope, FinalizationHandler, HandlerResult,
    ReplacePolicy, UnreachableHandler, UnreachableReason,
};
use warden_model::EventInstanceFlags;
use warden_types::{GenId, RemoteId, TaskId};

/// A named point from which events may be emitted.
///
/// Free generators live directly in a plan; task-bound generators are
/// owned by a task and identified by a symbol within its event
/// namespace. The generator holds the handler lists and the emission
/// history; the engine drives emission and command invocation.
#[derive(Debug)]
pub struct EventGenerator {
    id: GenId,
    remote_id: RemoteId,
    symbol: Option<String>,
    command: Option<CommandSpec>,
    owner: Option<TaskId>,
    flags: EventInstanceFlags,
    history: Vec<Emission>,
    emitted: bool,
    unreachable: bool,
    unreachable_reason: Option<UnreachableReason>,
    emit_handlers: Vec<EmitHandler>,
    unreachable_handlers: Vec<UnreachableHandler>,
    finalization_handlers: Vec<FinalizationHandler>,
}

impl EventGenerator {
    pub(crate) fn new(
        id: GenId,
        symbol: Option<String>,
        command: Option<CommandSpec>,
        owner: Option<TaskId>,
        flags: EventInstanceFlags,
    ) -> Self {
        Self {
            id,
            remote_id: RemoteId::new(),
            symbol,
            command,
            owner,
            flags,
            history: Vec::new(),
            emitted: false,
            unreachable: false,
            unreachable_reason: None,
            emit_handlers: Vec::new(),
            unreachable_handlers: Vec::new(),
            finalization_handlers: Vec::new(),
        }
    }

    /// Arena id.
    #[must_use]
    pub fn id(&self) -> GenId {
        self.id
    }

    /// Stable cross-process identity.
    #[must_use]
    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    /// Overrides the stable identity; used by restore paths that must
    /// preserve the identity carried in a dump.
    pub fn set_remote_id(&mut self, remote_id: RemoteId) {
        self.remote_id = remote_id;
    }

    /// Symbol within the owning task's namespace, or the free event's
    /// name.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    /// The owning task, `None` for free events.
    #[must_use]
    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Whether the generator has a command.
    #[must_use]
    pub fn controllable(&self) -> bool {
        self.command.is_some()
    }

    /// The command, present iff [`controllable`](Self::controllable).
    #[must_use]
    pub fn command(&self) -> Option<&CommandSpec> {
        self.command.as_ref()
    }

    /// Instance-level terminal/success/failure classification.
    #[must_use]
    pub fn flags(&self) -> EventInstanceFlags {
        self.flags
    }

    /// Whether emitting this event finishes the owning task.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.flags.terminal
    }

    /// Whether the generator emitted at least once. Monotonic.
    #[must_use]
    pub fn emitted(&self) -> bool {
        self.emitted
    }

    /// Whether the generator will never emit again.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    /// Why the generator became unreachable.
    #[must_use]
    pub fn unreachable_reason(&self) -> Option<&UnreachableReason> {
        self.unreachable_reason.as_ref()
    }

    /// The emission history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Emission] {
        &self.history
    }

    /// The most recent emission.
    #[must_use]
    pub fn last_emission(&self) -> Option<&Emission> {
        self.history.last()
    }

    /// Registers an on-emit handler with the default replace policy.
    pub fn on(
        &mut self,
        f: impl Fn(&mut dyn EventScope, &Emission) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.on_handler(EmitHandler::new(f));
    }

    /// Registers a one-shot on-emit handler.
    pub fn once(
        &mut self,
        f: impl Fn(&mut dyn EventScope, &Emission) -> HandlerResult + Send + Sync + 'static,
    ) {
        self.on_handler(EmitHandler::new(f).once());
    }

    /// Registers a prepared on-emit handler.
    pub fn on_handler(&mut self, handler: EmitHandler) {
        self.emit_handlers.push(handler);
    }

    /// Registers an if-unreachable handler.
    pub fn if_unreachable(
        &mut self,
        cancel_at_emission: bool,
        f: impl Fn(&mut dyn EventScope, GenId, &UnreachableReason) -> HandlerResult
            + Send
            + Sync
            + 'static,
    ) {
        self.if_unreachable_handler(UnreachableHandler::new(cancel_at_emission, f));
    }

    /// Registers a prepared if-unreachable handler.
    pub fn if_unreachable_handler(&mut self, handler: UnreachableHandler) {
        self.unreachable_handlers.push(handler);
    }

    /// Registers a finalization handler, invoked once when the
    /// generator is removed from its plan.
    pub fn when_finalized(&mut self, f: impl Fn(GenId) + Send + Sync + 'static) {
        self.when_finalized_handler(FinalizationHandler::new(f));
    }

    /// Registers a prepared finalization handler.
    pub fn when_finalized_handler(&mut self, handler: FinalizationHandler) {
        self.finalization_handlers.push(handler);
    }

    /// Snapshot of the on-emit handlers, in registration order.
    #[must_use]
    pub fn emit_handlers(&self) -> Vec<EmitHandler> {
        self.emit_handlers.clone()
    }

    /// Drops handlers registered as one-shot, after a dispatch.
    pub fn clear_once_handlers(&mut self) {
        self.emit_handlers.retain(|h| !h.once);
    }

    /// Records an emission. Cancels if-unreachable handlers registered
    /// with `cancel_at_emission`. Engine-facing.
    pub fn record_emission(&mut self, emission: Emission) {
        self.emitted = true;
        self.unreachable_handlers.retain(|h| !h.cancel_at_emission);
        self.history.push(emission);
    }

    /// Marks the generator unreachable and drains the handlers to run.
    /// Returns `None` when it already was unreachable (the transition
    /// happens once). Engine-facing.
    pub fn mark_unreachable(
        &mut self,
        reason: UnreachableReason,
    ) -> Option<Vec<UnreachableHandler>> {
        if self.unreachable {
            return None;
        }
        self.unreachable = true;
        self.unreachable_reason = Some(reason);
        Some(std::mem::take(&mut self.unreachable_handlers))
    }

    /// Finalization handlers, drained when the generator leaves its
    /// plan.
    pub(crate) fn take_finalization_handlers(&mut self) -> Vec<FinalizationHandler> {
        std::mem::take(&mut self.finalization_handlers)
    }

    /// Handlers to copy onto a replacement generator, given the
    /// replaced task's abstractness.
    #[must_use]
    pub(crate) fn handlers_to_copy(
        &self,
        replaced_is_abstract: bool,
    ) -> (
        Vec<EmitHandler>,
        Vec<UnreachableHandler>,
        Vec<FinalizationHandler>,
    ) {
        let copies = |policy: ReplacePolicy| policy.copies(replaced_is_abstract);
        (
            self.emit_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
            self.unreachable_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
            self.finalization_handlers
                .iter()
                .filter(|h| copies(h.policy))
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::PropagationId;

    fn generator() -> EventGenerator {
        EventGenerator::new(
            GenId::from_raw(1),
            Some("start".into()),
            Some(CommandSpec::EmitOnCall),
            Some(TaskId::from_raw(1)),
            EventInstanceFlags::default(),
        )
    }

    fn emission() -> Emission {
        Emission::new(
            PropagationId::from_raw(1),
            GenId::from_raw(1),
            Some(TaskId::from_raw(1)),
            vec![],
            vec![],
            vec![],
            vec![],
        )
    }

    #[test]
    fn emitted_is_monotonic() {
        let mut gen = generator();
        assert!(!gen.emitted());
        gen.record_emission(emission());
        assert!(gen.emitted());
        gen.record_emission(emission());
        assert!(gen.emitted());
        assert_eq!(gen.history().len(), 2);
    }

    #[test]
    fn emission_cancels_marked_unreachable_handlers() {
        let mut gen = generator();
        gen.if_unreachable(true, |_, _, _| Ok(()));
        gen.if_unreachable(false, |_, _, _| Ok(()));

        gen.record_emission(emission());
        let handlers = gen.mark_unreachable(UnreachableReason::Finalized).unwrap();
        // Only the cancel_at_emission: false handler survived.
        assert_eq!(handlers.len(), 1);
        assert!(!handlers[0].cancel_at_emission);
    }

    #[test]
    fn unreachable_transition_happens_once() {
        let mut gen = generator();
        gen.if_unreachable(false, |_, _, _| Ok(()));
        assert!(gen
            .mark_unreachable(UnreachableReason::EmitFailed("x".into()))
            .is_some());
        assert!(gen.mark_unreachable(UnreachableReason::Finalized).is_none());
        assert_eq!(
            gen.unreachable_reason(),
            Some(&UnreachableReason::EmitFailed("x".into()))
        );
    }

    #[test]
    fn once_handlers_are_dropped_after_dispatch() {
        let mut gen = generator();
        gen.on(|_, _| Ok(()));
        gen.once(|_, _| Ok(()));
        assert_eq!(gen.emit_handlers().len(), 2);
        gen.clear_once_handlers();
        assert_eq!(gen.emit_handlers().len(), 1);
    }

    #[test]
    fn handler_copy_respects_policy() {
        let mut gen = generator();
        gen.on_handler(EmitHandler::new(|_, _| Ok(())).with_policy(ReplacePolicy::Copy));
        gen.on_handler(EmitHandler::new(|_, _| Ok(())).with_policy(ReplacePolicy::Drop));
        gen.on(|_, _| Ok(())); // Default policy

        // Concrete replaced task: Default resolves to Drop.
        let (emit, _, _) = gen.handlers_to_copy(false);
        assert_eq!(emit.len(), 1);

        // Abstract replaced task: Default resolves to Copy.
        let (emit, _, _) = gen.handlers_to_copy(true);
        assert_eq!(emit.len(), 2);
    }
}
