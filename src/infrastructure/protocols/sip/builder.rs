//! SIP response builder

use super::message::{SipError, SipRequest, SipResponse};
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn bad_request() -> Self {
        Self::new(400)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Tag appended to the To header when the request carries none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Body together with its Content-Type
    pub fn sdp(mut self, sdp: String) -> Self {
        self.headers
            .push(Header::ContentType("application/sdp".into()));
        self.body = sdp.into_bytes();
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::To(to) => match &self.to_tag {
                    Some(tag) if !to.value().contains("tag=") => {
                        headers.push(Header::To(rsip::headers::To::new(format!(
                            "{};tag={}",
                            to.value(),
                            tag
                        ))));
                    }
                    _ => headers.push(header.clone()),
                },
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        let response = SipResponse::new(response);
        Ok(match self.reason {
            Some(reason) => response.with_reason(reason),
            None => response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        SipRequest::parse(
            b"INVITE sip:200@10.0.0.254 SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
              From: <sip:100@10.0.0.254>;tag=abc\r\n\
              To: <sip:200@10.0.0.254>\r\n\
              Call-ID: call-1\r\n\
              CSeq: 1 INVITE\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_build_copies_dialog_headers() {
        let response = ResponseBuilder::new(404)
            .reason("200 Not found")
            .build_for_request(&invite())
            .unwrap();

        assert_eq!(response.status_code(), 404);
        assert_eq!(response.reason(), "200 Not found");
        assert_eq!(response.call_id(), Some("call-1".to_string()));
        assert!(!response.to_value().unwrap().contains("tag="));
    }

    #[test]
    fn test_to_tag_and_body() {
        let response = ResponseBuilder::ok()
            .to_tag("xyz")
            .sdp("v=0\r\n".to_string())
            .build_for_request(&invite())
            .unwrap();

        assert!(response.to_value().unwrap().ends_with(";tag=xyz"));
        assert_eq!(response.body_text(), Some("v=0\r\n".to_string()));
    }
}
