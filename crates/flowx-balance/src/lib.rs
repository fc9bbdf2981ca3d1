pub mod balancer;
pub mod code;
pub mod p2c;

pub use balancer::Balancer;
pub use code::Code;
pub use p2c::{Backend, Done, NodeStat, P2cBuilder, P2cPicker, Pick};

static_assertions::assert_impl_all!(P2cPicker<std::net::SocketAddr>: Send, Sync);
static_assertions::assert_impl_all!(Balancer<std::net::SocketAddr>: Send, Sync);
