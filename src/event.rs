// the two halves of every conversation in this crate: producers push events
// through `SendEvent`, state machines consume them through `OnEvent`
// protocol state is only ever mutated from `OnEvent` implementations, and
// every implementation runs on one cooperative task, so a handler never
// observes a half-applied step of its own state

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M) -> anyhow::Result<()>;
}
