pub mod clock;
pub mod config;
pub mod controller;
pub mod epoch;
pub mod gps;
pub mod net;
pub mod ntp;
pub mod ntp_client;
pub mod ntp_server;
pub mod pps;
pub mod status;
pub mod traits;
