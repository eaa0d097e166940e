pub mod balancer;
pub mod circuit;
pub mod redirect;
pub mod table;

pub use balancer::{Balancer, SelectionStrategy};
pub use circuit::CircuitBreaker;
pub use redirect::Resolution;
pub use table::{RouteSnapshot, RouteTable};
