pub mod cryoboss;
pub mod transport;

pub use cryoboss::{Acknowledgement, Cryoboss, CryobossError, FRAME_LIMIT};
pub use transport::Transport;
