// Shared building blocks for the huddle workspace: the binary wire
// protocol, the awareness (presence) store, the replicated document,
// and the small value types both the broker and the client need.

pub mod awareness;
pub mod doc;
pub mod presence;
pub mod protocol;
pub mod room;
