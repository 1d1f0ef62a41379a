//! Wire messages shared by every process attached to the delivery fabric.
//!
//! These mirror `pubsub.proto` and `envelope.proto`; the definitions are kept
//! in Rust so the workspace builds without `protoc`.

pub mod pubsub {
    /// Notification broadcast on a device or connection-info channel.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PubSubMessage {
        #[prost(enumeration = "pub_sub_message::Type", tag = "1")]
        pub r#type: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub content: ::prost::alloc::vec::Vec<u8>,
    }

    pub mod pub_sub_message {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Type {
            Connected = 0,
            Deliver = 1,
            Keepalive = 2,
        }
    }
}

pub mod envelope {
    /// An encrypted message as routed between devices. The body is opaque.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(enumeration = "envelope::Type", optional, tag = "1")]
        pub r#type: ::core::option::Option<i32>,
        #[prost(string, optional, tag = "2")]
        pub source: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(uint32, optional, tag = "7")]
        pub source_device: ::core::option::Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub relay: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(uint64, optional, tag = "5")]
        pub timestamp: ::core::option::Option<u64>,
        #[prost(bytes = "vec", optional, tag = "6")]
        pub legacy_message: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "8")]
        pub content: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    pub mod envelope {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Type {
            Unknown = 0,
            Ciphertext = 1,
            KeyExchange = 2,
            PrekeyBundle = 3,
            Receipt = 5,
        }
    }
}
