pub mod client_greetor;
pub mod server_greetor;
