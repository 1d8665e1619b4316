mod runner;
mod scan_service;
