// WebSocket module
//
// - routes: HTTP routes (lobby CRUD, health) and the WebSocket upgrade
// - connection: per-socket read/write tasks and inbound routing

mod connection;
mod routes;

pub use routes::create_router;
