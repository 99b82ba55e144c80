// Placeholder crate: pulls in no dependencies of its own, but gives `health`
// a stable path to depend on without coupling it to any particular runtime.
