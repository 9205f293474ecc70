//! Typed client generation.

/// Generates a client struct with one async method per command.
///
/// ```ignore
/// mqrpc::rpc_client! {
///     pub struct CalculatorClient: sync for "calculator" {
///         fn add(AddRequest) -> Sum = "add";
///     }
/// }
///
/// mqrpc::rpc_client! {
///     pub struct AuditClient: async for "calculator" {
///         fn record(AuditEntry) = "record";
///     }
/// }
///
/// mqrpc::rpc_client! {
///     pub struct ReminderClient: delayed for "calculator" {
///         fn remind(AuditEntry) = "record";
///     }
/// }
/// ```
///
/// `sync` methods return the decoded success payload or an [`RpcError`]
/// (`Remote` for non-success replies). `async` methods return once the
/// broker accepted the message; `delayed` methods take the delay as a second
/// argument.
///
/// [`RpcError`]: crate::RpcError
#[macro_export]
macro_rules! rpc_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: sync for $rpc:literal {
            $( $(#[$fmeta:meta])* fn $method:ident($req:ty) -> $resp:ty = $command:literal; )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            invoker: $crate::SyncInvoker,
        }

        impl $name {
            pub const RPC_NAME: &'static str = $rpc;

            pub fn new(invoker: $crate::SyncInvoker) -> Self {
                Self { invoker }
            }

            pub async fn connect(
                broker: ::std::sync::Arc<dyn $crate::Broker>,
                config: $crate::ClientConfig,
            ) -> ::std::result::Result<Self, $crate::RpcError> {
                ::std::result::Result::Ok(Self::new(
                    $crate::SyncInvoker::connect(broker, $rpc, config).await?,
                ))
            }

            pub fn invoker(&self) -> &$crate::SyncInvoker {
                &self.invoker
            }

            $(
                $(#[$fmeta])*
                pub async fn $method(
                    &self,
                    request: &$req,
                ) -> ::std::result::Result<$resp, $crate::RpcError> {
                    self.invoker.call_typed($command, request).await
                }
            )*
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: async for $rpc:literal {
            $( $(#[$fmeta:meta])* fn $method:ident($req:ty) = $command:literal; )*
        }
    ) => {
        $crate::rpc_client!(@fire_and_forget $(#[$meta])* $vis $name $rpc);

        impl $name {
            $(
                $(#[$fmeta])*
                pub async fn $method(
                    &self,
                    request: &$req,
                ) -> ::std::result::Result<(), $crate::RpcError> {
                    self.invoker.send_typed($command, request).await
                }
            )*
        }
    };

    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: delayed for $rpc:literal {
            $( $(#[$fmeta:meta])* fn $method:ident($req:ty) = $command:literal; )*
        }
    ) => {
        $crate::rpc_client!(@fire_and_forget $(#[$meta])* $vis $name $rpc);

        impl $name {
            $(
                $(#[$fmeta])*
                pub async fn $method(
                    &self,
                    request: &$req,
                    delay: ::std::time::Duration,
                ) -> ::std::result::Result<(), $crate::RpcError> {
                    self.invoker.send_delayed_typed($command, request, delay).await
                }
            )*
        }
    };

    (@fire_and_forget $(#[$meta:meta])* $vis:vis $name:ident $rpc:literal) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $name {
            invoker: $crate::AsyncInvoker,
        }

        impl $name {
            pub const RPC_NAME: &'static str = $rpc;

            pub fn new(invoker: $crate::AsyncInvoker) -> Self {
                Self { invoker }
            }

            pub async fn connect(
                broker: ::std::sync::Arc<dyn $crate::Broker>,
                config: $crate::ClientConfig,
            ) -> ::std::result::Result<Self, $crate::RpcError> {
                ::std::result::Result::Ok(Self::new(
                    $crate::AsyncInvoker::connect(broker, $rpc, config).await?,
                ))
            }

            pub fn invoker(&self) -> &$crate::AsyncInvoker {
                &self.invoker
            }
        }
    };
}
