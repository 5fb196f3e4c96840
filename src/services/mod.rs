pub mod gateway;
pub mod identity;
pub mod image_service;
pub mod validation;
