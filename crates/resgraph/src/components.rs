//! Reusable groups of resources
//!
//! A component is a factory: it declares a handful of related resources on a
//! [`GraphBuilder`], tags each with the same [`ComponentId`] as parent, and
//! hands back the handles callers usually need.

use crate::error::Result;
use crate::graph::{GraphBuilder, NodeHandle};
use crate::output::Ref;
use crate::spec::{ComponentId, Input, ResourceId, ResourceSpec};
use serde_json::{Value, json};

pub const IAM_ROLE: &str = "aws:iam/role:Role";
pub const IAM_ROLE_POLICY_ATTACHMENT: &str = "aws:iam/rolePolicyAttachment:RolePolicyAttachment";
pub const SERVICE_ACCOUNT: &str = "kubernetes:core/v1:ServiceAccount";
pub const TRAEFIK_MIDDLEWARE: &str = "kubernetes:traefik.containo.us/v1alpha1:Middleware";
pub const TRAEFIK_INGRESS_ROUTE: &str = "kubernetes:traefik.containo.us/v1alpha1:IngressRoute";

const TRAEFIK_API_VERSION: &str = "traefik.containo.us/v1alpha1";
const S3_READ_ONLY_POLICY: &str = "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess";
const S3_FULL_ACCESS_POLICY: &str = "arn:aws:iam::aws:policy/AmazonS3FullAccess";
const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

fn with_provider(spec: ResourceSpec, provider: Option<&String>) -> ResourceSpec {
    match provider {
        Some(provider) => spec.provider(provider.clone()),
        None => spec,
    }
}

// ============================================================================
// Service account with an IAM role
// ============================================================================

/// Inputs for [`service_account_role`]
#[derive(Debug, Clone)]
pub struct ServiceAccountRoleArgs {
    /// `url` of the cluster's OIDC identity provider
    pub oidc_url: Input,
    /// `arn` of the cluster's OIDC identity provider
    pub oidc_arn: Input,
    pub namespace: Input,
    /// Grant read-only S3 access instead of full access
    pub read_only: bool,
    /// Binding for the IAM resources
    pub aws_provider: Option<String>,
    /// Binding for the service account
    pub kube_provider: Option<String>,
}

impl ServiceAccountRoleArgs {
    pub fn new(
        oidc_url: impl Into<Input>,
        oidc_arn: impl Into<Input>,
        namespace: impl Into<Input>,
    ) -> Self {
        Self {
            oidc_url: oidc_url.into(),
            oidc_arn: oidc_arn.into(),
            namespace: namespace.into(),
            read_only: false,
            aws_provider: None,
            kube_provider: None,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn aws_provider(mut self, provider: impl Into<String>) -> Self {
        self.aws_provider = Some(provider.into());
        self
    }

    pub fn kube_provider(mut self, provider: impl Into<String>) -> Self {
        self.kube_provider = Some(provider.into());
        self
    }
}

/// Handles to the resources declared by [`service_account_role`]
#[derive(Debug, Clone)]
pub struct ServiceAccountRole {
    pub component: ComponentId,
    pub role: NodeHandle,
    pub attachment: NodeHandle,
    pub service_account: NodeHandle,
}

impl ServiceAccountRole {
    /// Name of the Kubernetes service account
    pub fn name(&self) -> Ref<String> {
        self.service_account.attr("metadata.name")
    }

    pub fn role_arn(&self) -> Ref<String> {
        self.role.attr("arn")
    }
}

/// Kubernetes service account that pods use to assume an IAM role with S3
/// access
///
/// Declares the role (trusting the cluster's OIDC provider for this exact
/// service account), the S3 policy attachment, and the service account
/// annotated with the role ARN.
pub fn service_account_role(
    builder: &mut GraphBuilder,
    name: &str,
    args: ServiceAccountRoleArgs,
) -> Result<ServiceAccountRole> {
    let component = ComponentId::new("components:S3ServiceAccount", name);
    let account = name.to_string();

    let assume_role_policy = Input::apply(
        vec![args.oidc_url, args.oidc_arn, args.namespace.clone()],
        move |values| {
            let [url, arn, namespace] = values else {
                return Value::Null;
            };
            let url = url.as_str().unwrap_or_default();
            let namespace = namespace.as_str().unwrap_or_default();
            let issuer = url.strip_prefix("https://").unwrap_or(url);
            let mut subject = serde_json::Map::new();
            subject.insert(
                format!("{issuer}:sub"),
                json!([format!("system:serviceaccount:{namespace}:{account}")]),
            );
            let document = json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Action": ["sts:AssumeRoleWithWebIdentity"],
                    "Condition": { "StringEquals": subject },
                    "Effect": "Allow",
                    "Principal": { "Federated": [arn] },
                }],
            });
            Value::String(document.to_string())
        },
    );

    let role = builder.declare(with_provider(
        ResourceSpec::new(IAM_ROLE, name)
            .input("assumeRolePolicy", assume_role_policy)
            .parent(component.clone()),
        args.aws_provider.as_ref(),
    ))?;

    let policy_arn = if args.read_only {
        S3_READ_ONLY_POLICY
    } else {
        S3_FULL_ACCESS_POLICY
    };
    let attachment = builder.declare(with_provider(
        ResourceSpec::new(IAM_ROLE_POLICY_ATTACHMENT, name)
            .input("policyArn", policy_arn)
            .input("role", role.attr::<String>("id"))
            .parent(component.clone()),
        args.aws_provider.as_ref(),
    ))?;

    let service_account = builder.declare(with_provider(
        ResourceSpec::new(SERVICE_ACCOUNT, name)
            .input(
                "metadata",
                Input::object([
                    ("namespace", args.namespace),
                    ("name", Input::from(name)),
                    (
                        "annotations",
                        Input::object([(ROLE_ARN_ANNOTATION, role.attr::<String>("arn").into())]),
                    ),
                ]),
            )
            .parent(component.clone()),
        args.kube_provider.as_ref(),
    ))?;

    log::debug!("declared component {component}");
    Ok(ServiceAccountRole {
        component,
        role,
        attachment,
        service_account,
    })
}

// ============================================================================
// Traefik ingress route
// ============================================================================

/// Inputs for [`ingress_route`]
#[derive(Debug, Clone)]
pub struct IngressRouteArgs {
    pub namespace: Input,
    /// Path prefix routed to the service, e.g. `/mlflow`
    pub prefix: String,
    /// Name of the backing Kubernetes service
    pub service: Input,
    /// Service port; 80 when unset
    pub port: Option<Input>,
    /// Strip the prefix before forwarding
    pub strip_prefix: bool,
    pub provider: Option<String>,
    pub depends_on: Vec<ResourceId>,
}

impl IngressRouteArgs {
    pub fn new(
        namespace: impl Into<Input>,
        prefix: impl Into<String>,
        service: impl Into<Input>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            prefix: prefix.into(),
            service: service.into(),
            port: None,
            strip_prefix: true,
            provider: None,
            depends_on: Vec::new(),
        }
    }

    pub fn port(mut self, port: impl Into<Input>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }
}

/// Handles to the resources declared by [`ingress_route`]
#[derive(Debug, Clone)]
pub struct IngressRoute {
    pub component: ComponentId,
    /// Trailing-slash redirect first, then strip-prefix when enabled
    pub middlewares: Vec<NodeHandle>,
    pub route: NodeHandle,
}

fn middleware(namespace: &Input, name: &str, spec: Value) -> ResourceSpec {
    ResourceSpec::new(TRAEFIK_MIDDLEWARE, name)
        .input("apiVersion", TRAEFIK_API_VERSION)
        .input("kind", "Middleware")
        .input(
            "metadata",
            Input::object([("namespace", namespace.clone()), ("name", Input::from(name))]),
        )
        .input("spec", spec)
}

/// Route requests under a path prefix to a service through Traefik
pub fn ingress_route(
    builder: &mut GraphBuilder,
    name: &str,
    args: IngressRouteArgs,
) -> Result<IngressRoute> {
    let component = ComponentId::new("components:TraefikRoute", name);
    let prefix = &args.prefix;
    let mut middlewares = Vec::new();

    let trailing_slash = middleware(
        &args.namespace,
        &format!("{name}-trailing-slash"),
        json!({
            "redirectRegex": {
                "regex": format!("^.*\\{prefix}$"),
                "replacement": format!("{prefix}/"),
                "permanent": false,
            },
        }),
    );
    middlewares.push(builder.declare(with_provider(
        trailing_slash.parent(component.clone()),
        args.provider.as_ref(),
    ))?);

    if args.strip_prefix {
        let strip = middleware(
            &args.namespace,
            &format!("{name}-strip-prefix"),
            json!({ "stripPrefix": { "prefixes": [prefix] } }),
        );
        middlewares.push(builder.declare(with_provider(
            strip.parent(component.clone()),
            args.provider.as_ref(),
        ))?);
    }

    let middleware_refs = Input::list(middlewares.iter().map(|handle| {
        Input::object([("name", handle.attr::<String>("metadata.name").into())])
    }));
    let port = args.port.unwrap_or_else(|| Input::from(80_u16));

    let mut spec = ResourceSpec::new(TRAEFIK_INGRESS_ROUTE, format!("{name}-ingress-route"))
        .input("apiVersion", TRAEFIK_API_VERSION)
        .input("kind", "IngressRoute")
        .input(
            "metadata",
            Input::object([("namespace", args.namespace.clone())]),
        )
        .input(
            "spec",
            Input::object([
                ("entryPoints", Input::from(json!(["web"]))),
                (
                    "routes",
                    Input::list([Input::object([
                        ("match", Input::from(format!("PathPrefix(`{prefix}`)"))),
                        ("kind", Input::from("Rule")),
                        ("middlewares", middleware_refs),
                        (
                            "services",
                            Input::list([Input::object([
                                ("name", args.service),
                                ("port", port),
                            ])]),
                        ),
                    ])]),
                ),
            ]),
        )
        .parent(component.clone());
    for dep in args.depends_on {
        spec = spec.depends_on(dep);
    }
    let route = builder.declare(with_provider(spec, args.provider.as_ref()))?;

    log::debug!("declared component {component}");
    Ok(IngressRoute {
        component,
        middlewares,
        route,
    })
}
