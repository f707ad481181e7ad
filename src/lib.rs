pub mod commands;
pub mod connection;
pub mod controller;
pub mod gateway;
pub mod mqtt;
pub mod output;
pub mod registers;
pub mod scheduler;
pub mod sensors;
pub mod storage;
pub mod strategy;
pub mod value;
