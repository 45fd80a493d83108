pub mod discord;
pub mod telegram;
pub mod web;
