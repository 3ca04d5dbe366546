//! Language parsers

pub mod xml;

pub use xml::XmlParser;
