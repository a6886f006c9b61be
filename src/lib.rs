//! Meal photo analysis pipeline
//!
//! Library for the meal-analysis system: users upload food photos, a vision
//! model on Cloudflare Workers AI analyzes them asynchronously, and each
//! successful analysis becomes exactly one meal record. Jobs are scheduled
//! either by polling PostgreSQL or through a Redis-backed broker.

pub mod app_state;
pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
