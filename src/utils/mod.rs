pub mod data;
pub mod settlement_applier;
pub mod settlement_calculator;
pub mod settlement_service;
