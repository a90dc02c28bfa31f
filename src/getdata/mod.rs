//! Bulk sync: initial and delta data requests between peers.

pub mod handler;
pub mod messages;
pub mod request_data_handler;
pub mod request_data_manager;

pub use handler::GetDataRequestHandler;
pub use request_data_handler::RequestDataHandler;
pub use request_data_manager::RequestDataManager;

pub trait DataRequestListener: Send + Sync {
    fn on_preliminary_data_received(&self) {}

    fn on_updated_data_received(&self) {}

    fn on_no_seed_node_available(&self) {}
}
