// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Identity of the operation a pipeline wraps.
///
/// Middleware use the target to scope the keys they derive, so that the same input passed to
/// two different operations never collides.
///
/// # Examples
///
/// ```
/// use warden_pipeline::Target;
///
/// let target = Target::new("OrderService", "place_order");
///
/// assert_eq!(target.scope(), "order-service");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    type_name: Cow<'static, str>,
    method: Cow<'static, str>,
}

impl Target {
    /// Creates a target from a type name and a method name.
    #[must_use]
    pub fn new(type_name: impl Into<Cow<'static, str>>, method: impl Into<Cow<'static, str>>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
        }
    }

    /// Creates a target for a method on `T`, using the last segment of its type path.
    #[must_use]
    pub fn of<T: ?Sized>(method: impl Into<Cow<'static, str>>) -> Self {
        let full = std::any::type_name::<T>();
        let path = full.split('<').next().unwrap_or(full);
        let name = path.rsplit("::").next().unwrap_or(path);

        Self::new(name.to_string(), method)
    }

    /// The name of the type owning the operation.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The name of the operation.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The kebab-cased type name, used as the key scope by middleware.
    #[must_use]
    pub fn scope(&self) -> String {
        kebab_case(&self.type_name)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.method)
    }
}

/// Converts `PascalCase`, `camelCase` and `snake_case` identifiers to `kebab-case`.
///
/// Acronyms stay together: `HTTPServer` becomes `http-server`.
#[must_use]
pub fn kebab_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == '-' || c.is_whitespace() {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            continue;
        }

        if c.is_uppercase() && i > 0 && !out.is_empty() && !out.ends_with('-') {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower) {
                out.push('-');
            }
        }

        out.extend(c.to_lowercase());
    }

    while out.ends_with('-') {
        out.pop();
    }

    out
}

/// Call context shared by every middleware in one invocation.
///
/// Carries the [`Target`] identity and the instance the operation is invoked on, so that
/// middleware can reach services the instance owns.
pub struct Context<S> {
    target: Target,
    instance: Arc<S>,
}

impl<S> Context<S> {
    /// Creates a context for one invocation.
    #[must_use]
    pub fn new(target: Target, instance: Arc<S>) -> Self {
        Self { target, instance }
    }

    /// Identity of the wrapped operation.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The instance the operation is invoked on.
    #[must_use]
    pub fn instance(&self) -> &Arc<S> {
        &self.instance
    }
}

impl<S> Debug for Context<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("target", &self.target).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_variants() {
        assert_eq!(kebab_case("OrderService"), "order-service");
        assert_eq!(kebab_case("createTicket"), "create-ticket");
        assert_eq!(kebab_case("HTTPServer"), "http-server");
        assert_eq!(kebab_case("snake_case_name"), "snake-case-name");
        assert_eq!(kebab_case("Service2Go"), "service2-go");
        assert_eq!(kebab_case(""), "");
    }

    #[test]
    fn target_of_uses_last_path_segment() {
        struct TicketCommands;

        let target = Target::of::<TicketCommands>("create");

        assert_eq!(target.type_name(), "TicketCommands");
        assert_eq!(target.method(), "create");
        assert_eq!(target.scope(), "ticket-commands");
        assert_eq!(target.to_string(), "TicketCommands.create");
    }

    #[test]
    fn target_of_strips_generics() {
        let target = Target::of::<Vec<u8>>("push");

        assert_eq!(target.type_name(), "Vec");
    }
}
