//! VoucherService gRPC implementation.

use crate::grpc::identity::{caller_from_metadata, principal_from_proto, principal_to_proto};
use crate::grpc::proto::{
    voucher_service_server::VoucherService, AddSerialRequest, AddSerialResponse,
    AddUserRoleRequest, AddUserRoleResponse, CreateDomainCertRequest, CreateDomainCertResponse,
    CreateGroupRequest, CreateGroupResponse, DeleteDomainCertRequest, DeleteDomainCertResponse,
    DeleteGroupRequest, DeleteGroupResponse, GetDomainCertRequest, GetDomainCertResponse,
    GetGroupRequest, GetGroupResponse, GetOwnershipVoucherRequest, GetOwnershipVoucherResponse,
    GetSerialRequest, GetSerialResponse, GetUserRoleRequest, GetUserRoleResponse,
    RemoveSerialRequest, RemoveSerialResponse, RemoveUserRoleRequest, RemoveUserRoleResponse,
    UserRole as ProtoUserRole,
};
use crate::models::{Principal, Role};
use crate::services::metrics::{GRPC_REQUESTS_TOTAL, GRPC_REQUEST_DURATION};
use crate::services::{CustodyError, CustodyService};
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use service_core::error::AppError;
use service_core::grpc::IntoStatus;
use tonic::{Request, Response, Status};
use tracing::instrument;

/// VoucherService implementation.
pub struct VoucherServiceImpl {
    custody: CustodyService,
}

impl VoucherServiceImpl {
    pub fn new(custody: CustodyService) -> Self {
        Self { custody }
    }

    /// Resolve the caller, counting a failure against `method`.
    fn caller<T>(method: &str, request: &Request<T>) -> Result<Principal, Status> {
        caller_from_metadata(request.metadata()).map_err(|e| fail(method, e))
    }

    fn to_timestamp(dt: DateTime<Utc>) -> Timestamp {
        Timestamp {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() as i32,
        }
    }

    fn from_timestamp(
        method: &str,
        field: &str,
        ts: Option<Timestamp>,
    ) -> Result<Option<DateTime<Utc>>, Status> {
        let Some(ts) = ts else {
            return Ok(None);
        };
        let nanos = u32::try_from(ts.nanos).ok();
        nanos
            .and_then(|n| DateTime::from_timestamp(ts.seconds, n))
            .map(Some)
            .ok_or_else(|| {
                fail(
                    method,
                    AppError::InvalidArgument(anyhow::anyhow!("{} is not a valid timestamp", field)),
                )
            })
    }
}

/// Count a failed request and convert it to a status.
fn fail(method: &str, err: AppError) -> Status {
    GRPC_REQUESTS_TOTAL
        .with_label_values(&[method, err.kind()])
        .inc();
    err.into_status()
}

/// Count the outcome of a custody call.
fn finish<T>(method: &str, result: Result<T, CustodyError>) -> Result<T, Status> {
    match result {
        Ok(value) => {
            GRPC_REQUESTS_TOTAL.with_label_values(&[method, "ok"]).inc();
            Ok(value)
        }
        Err(e) => Err(fail(method, AppError::from(e))),
    }
}

#[tonic::async_trait]
impl VoucherService for VoucherServiceImpl {
    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "CreateGroup")
    )]
    async fn create_group(
        &self,
        request: Request<CreateGroupRequest>,
    ) -> Result<Response<CreateGroupResponse>, Status> {
        const METHOD: &str = "CreateGroup";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        let group_id = finish(
            METHOD,
            self.custody
                .create_group(&caller, &req.parent_group_id, &req.description)
                .await,
        )?;

        Ok(Response::new(CreateGroupResponse { group_id }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "DeleteGroup")
    )]
    async fn delete_group(
        &self,
        request: Request<DeleteGroupRequest>,
    ) -> Result<Response<DeleteGroupResponse>, Status> {
        const METHOD: &str = "DeleteGroup";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        finish(METHOD, self.custody.delete_group(&caller, &req.group_id).await)?;

        Ok(Response::new(DeleteGroupResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "GetGroup")
    )]
    async fn get_group(
        &self,
        request: Request<GetGroupRequest>,
    ) -> Result<Response<GetGroupResponse>, Status> {
        const METHOD: &str = "GetGroup";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        let details = finish(METHOD, self.custody.get_group(&caller, &req.group_id).await)?;

        Ok(Response::new(GetGroupResponse {
            group_id: details.group.group_id,
            parent_group_id: details.group.parent_group_id.unwrap_or_default(),
            description: details.group.description,
            org_id: details.group.org_id,
            cert_ids: details.cert_ids,
            serial_numbers: details.serial_numbers,
            user_roles: details
                .grants
                .iter()
                .map(|g| ProtoUserRole {
                    user: Some(principal_to_proto(&g.principal)),
                    role: g.role.to_proto(),
                })
                .collect(),
            child_group_ids: details.child_group_ids,
            created_at: Some(Self::to_timestamp(details.group.created_utc)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "AddUserRole")
    )]
    async fn add_user_role(
        &self,
        request: Request<AddUserRoleRequest>,
    ) -> Result<Response<AddUserRoleResponse>, Status> {
        const METHOD: &str = "AddUserRole";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();
        let user = principal_from_proto(req.user).map_err(|e| fail(METHOD, e))?;

        finish(
            METHOD,
            self.custody
                .add_user_role(&caller, &user, &req.group_id, Role::from_proto(req.role))
                .await,
        )?;

        Ok(Response::new(AddUserRoleResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "RemoveUserRole")
    )]
    async fn remove_user_role(
        &self,
        request: Request<RemoveUserRoleRequest>,
    ) -> Result<Response<RemoveUserRoleResponse>, Status> {
        const METHOD: &str = "RemoveUserRole";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();
        let user = principal_from_proto(req.user).map_err(|e| fail(METHOD, e))?;

        finish(
            METHOD,
            self.custody
                .remove_user_role(&caller, &user, &req.group_id, Role::from_proto(req.role))
                .await,
        )?;

        Ok(Response::new(RemoveUserRoleResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "GetUserRole")
    )]
    async fn get_user_role(
        &self,
        request: Request<GetUserRoleRequest>,
    ) -> Result<Response<GetUserRoleResponse>, Status> {
        const METHOD: &str = "GetUserRole";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();
        let user = principal_from_proto(req.user).map_err(|e| fail(METHOD, e))?;

        let roles = finish(METHOD, self.custody.get_user_role(&caller, &user).await)?;

        Ok(Response::new(GetUserRoleResponse {
            group_roles: roles
                .into_iter()
                .map(|(group_id, role)| (group_id, role.to_proto()))
                .collect(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "AddSerial")
    )]
    async fn add_serial(
        &self,
        request: Request<AddSerialRequest>,
    ) -> Result<Response<AddSerialResponse>, Status> {
        const METHOD: &str = "AddSerial";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        finish(
            METHOD,
            self.custody
                .add_serial(&caller, &req.serial_number, &req.group_id)
                .await,
        )?;

        Ok(Response::new(AddSerialResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "RemoveSerial")
    )]
    async fn remove_serial(
        &self,
        request: Request<RemoveSerialRequest>,
    ) -> Result<Response<RemoveSerialResponse>, Status> {
        const METHOD: &str = "RemoveSerial";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        finish(
            METHOD,
            self.custody
                .remove_serial(&caller, &req.serial_number, &req.group_id)
                .await,
        )?;

        Ok(Response::new(RemoveSerialResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "GetSerial")
    )]
    async fn get_serial(
        &self,
        request: Request<GetSerialRequest>,
    ) -> Result<Response<GetSerialResponse>, Status> {
        const METHOD: &str = "GetSerial";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        let details = finish(
            METHOD,
            self.custody.get_serial(&caller, &req.serial_number).await,
        )?;

        Ok(Response::new(GetSerialResponse {
            serial_number: details.record.serial_number,
            public_key_der: details.record.public_key_der.unwrap_or_default(),
            mac_addr: details.record.mac_addr.unwrap_or_default(),
            group_ids: details.group_ids,
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "CreateDomainCert")
    )]
    async fn create_domain_cert(
        &self,
        request: Request<CreateDomainCertRequest>,
    ) -> Result<Response<CreateDomainCertResponse>, Status> {
        const METHOD: &str = "CreateDomainCert";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();
        let expiry = Self::from_timestamp(METHOD, "expiry_time", req.expiry_time)?;

        let cert_id = finish(
            METHOD,
            self.custody
                .create_domain_cert(
                    &caller,
                    &req.group_id,
                    req.certificate_der,
                    req.revocation_checks,
                    expiry,
                )
                .await,
        )?;

        Ok(Response::new(CreateDomainCertResponse { cert_id }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "DeleteDomainCert")
    )]
    async fn delete_domain_cert(
        &self,
        request: Request<DeleteDomainCertRequest>,
    ) -> Result<Response<DeleteDomainCertResponse>, Status> {
        const METHOD: &str = "DeleteDomainCert";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        finish(
            METHOD,
            self.custody.delete_domain_cert(&caller, &req.cert_id).await,
        )?;

        Ok(Response::new(DeleteDomainCertResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "GetDomainCert")
    )]
    async fn get_domain_cert(
        &self,
        request: Request<GetDomainCertRequest>,
    ) -> Result<Response<GetDomainCertResponse>, Status> {
        const METHOD: &str = "GetDomainCert";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();

        let cert = finish(
            METHOD,
            self.custody.get_domain_cert(&caller, &req.cert_id).await,
        )?;

        Ok(Response::new(GetDomainCertResponse {
            cert_id: cert.cert_id,
            group_id: cert.group_id,
            certificate_der: cert.certificate_der,
            revocation_checks: cert.revocation_checks,
            expiry_time: Some(Self::to_timestamp(cert.expiry_utc)),
            created_at: Some(Self::to_timestamp(cert.created_utc)),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(service = "voucher-service", method = "GetOwnershipVoucher")
    )]
    async fn get_ownership_voucher(
        &self,
        request: Request<GetOwnershipVoucherRequest>,
    ) -> Result<Response<GetOwnershipVoucherResponse>, Status> {
        const METHOD: &str = "GetOwnershipVoucher";
        let _timer = GRPC_REQUEST_DURATION
            .with_label_values(&[METHOD])
            .start_timer();
        let caller = Self::caller(METHOD, &request)?;
        let req = request.into_inner();
        let lifetime = Self::from_timestamp(METHOD, "lifetime", req.lifetime)?;

        let issued = finish(
            METHOD,
            self.custody
                .get_ownership_voucher(
                    &caller,
                    &req.serial_number,
                    &req.cert_id,
                    lifetime,
                    &req.ien,
                )
                .await,
        )?;

        Ok(Response::new(GetOwnershipVoucherResponse {
            voucher: issued.voucher,
            public_key_der: issued.public_key_der,
        }))
    }
}
