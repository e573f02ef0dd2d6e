pub mod print_config;
pub mod serve;

pub use print_config::handle_print_config;
pub use serve::handle_serve;
