pub mod hardware;
pub mod logging;
pub mod udp;
