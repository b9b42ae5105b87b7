/// The default size for FSM mailboxes and other bounded channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
/// A smaller size for channels which only see occasional traffic.
pub const SMALLER_CHANNEL_SIZE: usize = 16;
