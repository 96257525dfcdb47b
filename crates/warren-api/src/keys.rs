//! Well-known label and annotation keys. These are wire-visible.

/// Fingerprint of the owning Sandbox's name, on its Pod and Service.
pub const SANDBOX_NAME_HASH_LABEL: &str = "agents.x-k8s.io/sandbox-name-hash";

/// Pool membership of an unclaimed pod; the value is the pool name.
pub const POOL_LABEL: &str = "agents.x-k8s.io/pool";

/// Fingerprint of the template a pool pod was built from.
pub const TEMPLATE_REF_HASH_LABEL: &str = "agents.x-k8s.io/sandbox-template-ref-hash";

/// UID of the claim a Sandbox's pod serves.
pub const CLAIM_UID_LABEL: &str = "agents.x-k8s.io/claim-uid";

/// Name of the Pod backing a Sandbox when it differs from the Sandbox name.
pub const POD_NAME_ANNOTATION: &str = "agents.x-k8s.io/pod-name";

/// Present on a claim-created Sandbox while pool adoption is in flight.
pub const PENDING_ADOPTION_ANNOTATION: &str = "agents.x-k8s.io/pending-adoption";

/// JSON map of W3C trace propagation headers.
pub const TRACE_CONTEXT_ANNOTATION: &str = "opentelemetry.io/trace-context";
